//! Capture session controller.
//!
//! Owns one capture attempt from the instructions screen to a committed
//! avatar (or a skip). The live camera sits behind an `RwLock`: the pose
//! loop and the capture take read access, while the watchdog holds write
//! access for a whole restart. Session state sits behind a `Mutex` and
//! carries an epoch. Every periodic task captures the epoch it was started
//! under and exits once it changes, so timers from an abandoned attempt can
//! never touch a newer one.
//!
//! Lock order is session, then camera. No task acquires the session lock
//! while holding the camera lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use selfie_core::{
    CalibrationEvent, CalibrationExtremes, CalibrationMachine, ChallengeEvent, ChallengeMachine,
    FaceGate, PoseEstimator, PoseSample, ProgressEvent,
};
use selfie_hw::{
    CameraError, CameraHealth, CameraSession, Constraints, FrameWatchdog, MediaBackend,
    PlaybackState,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::detector::{verify_model_files, DetectorError, LandmarkDetector};
use crate::error::CaptureError;
use crate::status::{CalibrationStatus, CaptureStatus, ChallengeStatus, Stage};
use crate::still::StillImage;
use crate::storage::{avatar_key, BlobStorage, ProfileStore};

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub media: Arc<dyn MediaBackend>,
    pub detector: Arc<dyn LandmarkDetector>,
    pub blobs: Arc<dyn BlobStorage>,
    pub profiles: Arc<dyn ProfileStore>,
}

/// Result of a committed capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    pub public_ref: String,
    /// The still came from the camera after passing the liveness challenge.
    /// `false` for a manually supplied file.
    pub liveness_verified: bool,
    pub session_id: Uuid,
}

/// Completion callbacks. `on_capture_complete` fires exactly once per
/// successful session, `on_skip` at most once, never both.
pub trait CaptureListener: Send + Sync {
    fn on_capture_complete(&self, receipt: &CaptureReceipt);
    fn on_skip(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ModelState {
    Pending,
    Ready,
    Failed(String),
}

enum Liveness {
    Idle,
    Calibrating(CalibrationMachine),
    Challenging(ChallengeMachine),
}

struct HeldStill {
    still: StillImage,
    liveness_verified: bool,
    key: String,
    /// Set once the blob is stored, so a retry after a failed link does not
    /// upload again.
    uploaded_ref: Option<String>,
}

struct CommitJob {
    epoch: u64,
    key: String,
    jpeg: Vec<u8>,
    uploaded_ref: Option<String>,
    liveness_verified: bool,
}

enum PoseOutcome {
    Continue,
    StartCountdown,
    Satisfied,
}

struct Session {
    stage: Stage,
    epoch: u64,
    tasks: CancellationToken,
    models: ModelState,
    pose: PoseEstimator,
    gate: FaceGate,
    liveness: Liveness,
    calibrated: Option<CalibrationExtremes>,
    still: Option<HeldStill>,
    /// A completion or skip callback has fired.
    finished: bool,
}

impl Session {
    /// Cancel every running task and open a new epoch.
    fn stop_tasks(&mut self) -> u64 {
        self.tasks.cancel();
        self.tasks = CancellationToken::new();
        self.epoch += 1;
        self.epoch
    }

    fn reset_liveness(&mut self) {
        self.pose.reset_baseline();
        self.gate.reset();
        self.liveness = Liveness::Idle;
        self.calibrated = None;
    }

    fn on_pose(&mut self, sample: PoseSample, config: &Config) -> PoseOutcome {
        match self.stage {
            Stage::Camera => {
                if self.gate.observe(sample.face_found) {
                    tracing::info!("face stable, starting calibration");
                    self.stage = Stage::Calibration;
                    self.liveness =
                        Liveness::Calibrating(CalibrationMachine::new(config.calibration.clone()));
                }
                PoseOutcome::Continue
            }
            Stage::Calibration => {
                let Liveness::Calibrating(machine) = &mut self.liveness else {
                    return PoseOutcome::Continue;
                };
                match machine.observe(&sample) {
                    CalibrationEvent::Done(extremes) => {
                        self.calibrated = Some(extremes);
                        self.stage = Stage::Challenge;
                        self.liveness =
                            Liveness::Challenging(ChallengeMachine::new(config.challenge.clone()));
                        PoseOutcome::StartCountdown
                    }
                    _ => PoseOutcome::Continue,
                }
            }
            Stage::Challenge => {
                let Liveness::Challenging(machine) = &mut self.liveness else {
                    return PoseOutcome::Continue;
                };
                if machine.is_stalled(sample.timestamp) {
                    tracing::warn!(
                        index = machine.index(),
                        "challenge stalled, returning to camera"
                    );
                    self.reset_liveness();
                    self.stage = Stage::Camera;
                    return PoseOutcome::Continue;
                }
                match machine.observe(&sample) {
                    ChallengeEvent::Satisfied => PoseOutcome::Satisfied,
                    _ => PoseOutcome::Continue,
                }
            }
            _ => PoseOutcome::Continue,
        }
    }

    fn snapshot(&self) -> CaptureStatus {
        let calibration = match &self.liveness {
            Liveness::Calibrating(m) => Some(CalibrationStatus {
                phase: m.phase(),
                hold_count: m.hold_count(),
                extremes: m.extremes(),
            }),
            _ => self.calibrated.map(|extremes| CalibrationStatus {
                phase: selfie_core::CalibrationPhase::Done,
                hold_count: 0,
                extremes,
            }),
        };
        let challenge = match &self.liveness {
            Liveness::Challenging(m) => Some(ChallengeStatus {
                index: m.index(),
                countdown: m.countdown_remaining(),
                armed: m.is_armed(),
                flags: m.flags(),
                progress: m.progress(),
                completed: m.completed_flags().to_vec(),
                verified: m.is_verified(),
            }),
            _ => None,
        };
        CaptureStatus {
            stage: self.stage.clone(),
            face_streak: self.gate.streak(),
            model_error: match &self.models {
                ModelState::Failed(msg) => Some(CaptureError::ModelLoadFailed(msg.clone())),
                _ => None,
            },
            pitch_baseline: self.pose.baseline(),
            calibration,
            challenge,
            has_still: self.still.is_some(),
        }
    }

    fn invalid(&self, action: &'static str) -> CaptureError {
        CaptureError::InvalidStage {
            action,
            stage: self.stage.kind(),
        }
    }

    /// Move to `Committing` and snapshot what the commit needs.
    fn begin_commit(&mut self) -> Result<CommitJob, CaptureError> {
        let Some(held) = self.still.as_ref() else {
            return Err(self.invalid("commit"));
        };
        let job = CommitJob {
            epoch: self.epoch,
            key: held.key.clone(),
            jpeg: held.still.jpeg.clone(),
            uploaded_ref: held.uploaded_ref.clone(),
            liveness_verified: held.liveness_verified,
        };
        self.stage = Stage::Committing;
        Ok(job)
    }
}

struct Inner {
    config: Config,
    user_id: String,
    session_id: Uuid,
    collab: Collaborators,
    listener: Arc<dyn CaptureListener>,
    camera: Arc<RwLock<CameraSession>>,
    session: Mutex<Session>,
    status_tx: watch::Sender<CaptureStatus>,
    health_tx: watch::Sender<CameraHealth>,
}

/// Clone-safe handle to one capture session.
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl CaptureController {
    pub fn new(
        config: Config,
        user_id: impl Into<String>,
        collab: Collaborators,
        listener: Arc<dyn CaptureListener>,
    ) -> Self {
        let camera = CameraSession::new(Arc::clone(&collab.media), config.playback.clone());
        let session = Session {
            stage: Stage::Instructions,
            epoch: 0,
            tasks: CancellationToken::new(),
            models: ModelState::Pending,
            pose: PoseEstimator::new(config.pose.clone()),
            gate: FaceGate::new(config.face_gate_ticks),
            liveness: Liveness::Idle,
            calibrated: None,
            still: None,
            finished: false,
        };
        let (status_tx, _) = watch::channel(CaptureStatus::initial());
        let (health_tx, _) = watch::channel(CameraHealth::default());
        let session_id = Uuid::new_v4();
        tracing::debug!(%session_id, "capture session created");

        Self {
            inner: Arc::new(Inner {
                config,
                user_id: user_id.into(),
                session_id,
                collab,
                listener,
                camera: Arc::new(RwLock::new(camera)),
                session: Mutex::new(session),
                status_tx,
                health_tx,
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn status(&self) -> CaptureStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CaptureStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn camera_health(&self) -> watch::Receiver<CameraHealth> {
        self.inner.health_tx.subscribe()
    }

    /// Leave the instructions screen: load the landmark model and open the
    /// camera concurrently.
    ///
    /// A camera failure lands in [`Stage::CameraError`] and is returned. A
    /// model failure does not stop the preview: it is returned as
    /// [`CaptureError::ModelLoadFailed`], reported through
    /// [`CaptureStatus::model_error`], and face gating never passes until
    /// [`retry_models`](Self::retry_models) or a retake loads it.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let epoch = {
            let mut session = self.inner.session.lock().await;
            if session.stage != Stage::Instructions {
                return Err(session.invalid("start"));
            }
            session.stage = Stage::ModelLoading;
            self.inner.publish(&session);
            session.epoch
        };
        self.inner.boot(epoch).await
    }

    /// Retry from the camera error screen.
    pub async fn retry_camera(&self) -> Result<(), CaptureError> {
        let epoch = {
            let mut session = self.inner.session.lock().await;
            if !matches!(session.stage, Stage::CameraError(_)) {
                return Err(session.invalid("retry camera"));
            }
            session.reset_liveness();
            session.stage = Stage::ModelLoading;
            self.inner.publish(&session);
            session.epoch
        };
        self.inner.boot(epoch).await
    }

    /// Start playback from a user gesture after autoplay was refused.
    pub async fn request_manual_play(&self) -> Result<(), CaptureError> {
        let mut session = self.inner.session.lock().await;
        if session.stage != Stage::AwaitingPlayGesture {
            return Err(session.invalid("manual play"));
        }
        let result = self.inner.camera.write().await.request_manual_play().await;
        match result {
            Ok(PlaybackState::Playing) => {
                self.inner.enter_camera(&mut session).await;
            }
            Ok(PlaybackState::AutoplayBlocked) => {
                tracing::info!("manual play still blocked");
            }
            Ok(PlaybackState::NoFrames) => {
                session.stage = Stage::CameraError(CameraError::NoFrames);
            }
            Err(e) => {
                session.stage = Stage::CameraError(e);
            }
        }
        self.inner.publish(&session);
        match &session.stage {
            Stage::CameraError(e) => Err(e.clone().into()),
            _ => Ok(()),
        }
    }

    /// Load the landmark model again after a failure. The preview keeps
    /// running while it loads.
    pub async fn retry_models(&self) -> Result<(), CaptureError> {
        {
            let session = self.inner.session.lock().await;
            if session.stage.is_terminal() || !matches!(session.models, ModelState::Failed(_)) {
                return Err(session.invalid("retry models"));
            }
        }
        self.inner.reload_models().await
    }

    /// Throw away calibration, challenge and any held still, and go back to
    /// the live preview. A failed landmark model is loaded again.
    pub async fn retake(&self) -> Result<(), CaptureError> {
        let mut session = self.inner.session.lock().await;
        match session.stage {
            Stage::Camera | Stage::Calibration | Stage::Challenge | Stage::Preview { .. } => {}
            _ => return Err(session.invalid("retake")),
        }
        let epoch = session.stop_tasks();
        session.reset_liveness();
        session.still = None;
        tracing::info!("retake requested");

        if self.inner.camera.read().await.is_active() {
            self.inner.enter_camera(&mut session).await;
            self.inner.publish(&session);
            drop(session);
            return self.inner.reload_models().await;
        }

        session.stage = Stage::ModelLoading;
        self.inner.publish(&session);
        drop(session);
        self.inner.boot(epoch).await
    }

    /// Retry the upload and profile link for the held still.
    pub async fn retry_commit(&self) -> Result<CaptureReceipt, CaptureError> {
        let job = {
            let mut session = self.inner.session.lock().await;
            if !matches!(session.stage, Stage::Preview { .. }) {
                return Err(session.invalid("retry commit"));
            }
            let job = session.begin_commit()?;
            self.inner.publish(&session);
            job
        };
        self.inner.commit(job).await
    }

    /// Commit a user-supplied image instead of a live capture. The result is
    /// not liveness-verified.
    pub async fn use_file(&self, bytes: Vec<u8>) -> Result<CaptureReceipt, CaptureError> {
        {
            let session = self.inner.session.lock().await;
            if !accepts_file(&session.stage) {
                return Err(session.invalid("use file"));
            }
        }

        let quality = self.inner.config.jpeg_quality;
        let still = tokio::task::spawn_blocking(move || StillImage::from_file_bytes(&bytes, quality))
            .await
            .map_err(|e| CaptureError::Image(e.to_string()))??;

        let job = {
            let mut session = self.inner.session.lock().await;
            if !accepts_file(&session.stage) {
                return Err(session.invalid("use file"));
            }
            session.stop_tasks();
            session.reset_liveness();
            session.still = Some(HeldStill {
                still,
                liveness_verified: false,
                key: avatar_key(&self.inner.user_id, &Uuid::new_v4()),
                uploaded_ref: None,
            });
            let job = session.begin_commit()?;
            self.inner.publish(&session);
            job
        };
        self.inner.camera.write().await.teardown();
        tracing::info!("using manually supplied image");
        self.inner.commit(job).await
    }

    /// Leave without an avatar. Fires [`CaptureListener::on_skip`] once.
    pub async fn skip(&self) -> Result<(), CaptureError> {
        {
            let mut session = self.inner.session.lock().await;
            if session.finished || session.stage.is_terminal() || session.stage == Stage::Committing
            {
                return Err(session.invalid("skip"));
            }
            session.stop_tasks();
            session.stage = Stage::Skipped;
            session.still = None;
            session.finished = true;
            self.inner.publish(&session);
        }
        self.inner.camera.write().await.teardown();
        tracing::info!("capture skipped");
        self.inner.listener.on_skip();
        Ok(())
    }

    /// Stop everything and release the camera. No callback fires.
    pub async fn cancel(&self) {
        {
            let mut session = self.inner.session.lock().await;
            if session.stage.is_terminal() {
                return;
            }
            session.stop_tasks();
            session.stage = Stage::Cancelled;
            session.still = None;
            self.inner.publish(&session);
        }
        self.inner.camera.write().await.teardown();
        tracing::info!("capture cancelled");
    }
}

fn accepts_file(stage: &Stage) -> bool {
    matches!(
        stage,
        Stage::Instructions
            | Stage::ModelLoading
            | Stage::AwaitingPlayGesture
            | Stage::Camera
            | Stage::Calibration
            | Stage::Challenge
            | Stage::Preview { .. }
            | Stage::CameraError(_)
    )
}

/// Sleep for `duration`; `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Inner {
    fn publish(&self, session: &Session) {
        self.status_tx.send_replace(session.snapshot());
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Open the camera and, unless already loaded, the landmark model.
    async fn boot(self: &Arc<Self>, epoch: u64) -> Result<(), CaptureError> {
        let needs_models = {
            let session = self.session.lock().await;
            session.models != ModelState::Ready
        };
        let constraints = Constraints::for_form_factor(self.config.form_factor);

        let load = async {
            if needs_models {
                Some(self.load_models().await)
            } else {
                None
            }
        };
        let open = async { self.camera.write().await.start(&constraints).await };
        let (models, camera) = tokio::join!(load, open);

        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            drop(session);
            tracing::debug!("startup superseded, releasing camera");
            self.camera.write().await.teardown();
            return Ok(());
        }

        let models = match models {
            Some(result) => Self::record_models(&mut session, result),
            None => Ok(()),
        };

        let result = match camera {
            Ok(PlaybackState::Playing) => {
                self.enter_camera(&mut session).await;
                Ok(())
            }
            Ok(PlaybackState::AutoplayBlocked) => {
                session.stage = Stage::AwaitingPlayGesture;
                Ok(())
            }
            Ok(PlaybackState::NoFrames) => {
                session.stage = Stage::CameraError(CameraError::NoFrames);
                Err(CaptureError::Camera(CameraError::NoFrames))
            }
            Err(e) => {
                tracing::warn!(error = %e, "camera unavailable");
                session.stage = Stage::CameraError(e.clone());
                Err(CaptureError::Camera(e))
            }
        };
        self.publish(&session);
        // a camera failure outranks a model failure
        result.and(models)
    }

    async fn load_models(&self) -> Result<(), DetectorError> {
        if let Some(manifest) = &self.config.model_manifest {
            verify_model_files(&self.config.model_dir, manifest).await?;
        }
        self.collab.detector.load().await?;
        tracing::info!("landmark model loaded");
        Ok(())
    }

    fn record_models(
        session: &mut Session,
        result: Result<(), DetectorError>,
    ) -> Result<(), CaptureError> {
        match result {
            Ok(()) => {
                session.models = ModelState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "landmark model unavailable");
                session.models = ModelState::Failed(e.to_string());
                Err(CaptureError::ModelLoadFailed(e.to_string()))
            }
        }
    }

    /// Load the model again if the last attempt failed. The camera and the
    /// running tasks are left alone; the pose loop starts detecting on its
    /// next tick once the model is ready.
    async fn reload_models(&self) -> Result<(), CaptureError> {
        {
            let mut session = self.session.lock().await;
            if !matches!(session.models, ModelState::Failed(_)) {
                return Ok(());
            }
            session.models = ModelState::Pending;
            self.publish(&session);
        }
        tracing::info!("retrying landmark model load");
        let result = self.load_models().await;

        let mut session = self.session.lock().await;
        let outcome = Self::record_models(&mut session, result);
        self.publish(&session);
        outcome
    }

    /// Enter the live preview and start the pose loop and watchdog under
    /// the current epoch.
    async fn enter_camera(self: &Arc<Self>, session: &mut Session) {
        session.stage = Stage::Camera;
        session.gate.reset();
        let epoch = session.epoch;
        let cancel = session.tasks.clone();

        let events = self.camera.write().await.take_track_events();
        let watchdog = FrameWatchdog::resume(self.config.watchdog.clone(), &self.health_tx.borrow());

        tokio::spawn(Arc::clone(self).pose_loop(epoch, cancel.clone()));

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let camera = Arc::clone(&inner.camera);
            if let Err(e) = watchdog.run(camera, events, &inner.health_tx, cancel).await {
                inner.camera_failed(epoch, e).await;
            }
        });
    }

    async fn camera_failed(&self, epoch: u64, error: CameraError) {
        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            return;
        }
        session.stop_tasks();
        session.reset_liveness();
        session.stage = Stage::CameraError(error);
        self.publish(&session);
    }

    // ── Periodic tasks ────────────────────────────────────────────────────────

    async fn pose_loop(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        tracing::debug!(epoch, "pose loop started");
        loop {
            if !sleep_or_cancel(self.config.pose_interval, &cancel).await {
                break;
            }

            let models_ready = self.session.lock().await.models == ModelState::Ready;
            let frame = if models_ready {
                self.camera.read().await.grab_frame()
            } else {
                None
            };
            let landmarks = match frame {
                Some(frame) => match self.collab.detector.detect(&frame).await {
                    Ok(landmarks) => landmarks,
                    Err(e) => {
                        tracing::warn!(error = %e, "landmark detection failed");
                        None
                    }
                },
                None => None,
            };

            let at = now();
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                break;
            }
            let sample = landmarks
                .as_ref()
                .and_then(|l| session.pose.estimate(l, at))
                .unwrap_or_else(|| PoseSample::no_face(at));
            let outcome = session.on_pose(sample, &self.config);
            self.publish(&session);
            drop(session);

            match outcome {
                PoseOutcome::Continue => {}
                PoseOutcome::StartCountdown => {
                    tokio::spawn(Arc::clone(&self).countdown(epoch, cancel.clone()));
                }
                PoseOutcome::Satisfied => {
                    tokio::spawn(Arc::clone(&self).complete_challenge(epoch, cancel.clone()));
                }
            }
        }
        tracing::debug!(epoch, "pose loop stopped");
    }

    async fn countdown(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        loop {
            if !sleep_or_cancel(COUNTDOWN_TICK, &cancel).await {
                return;
            }
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            let Liveness::Challenging(machine) = &mut session.liveness else {
                return;
            };
            let remaining = machine.countdown_tick(now());
            self.publish(&session);
            if remaining == 0 {
                return;
            }
        }
    }

    /// Run the completion animation for a satisfied challenge, then either
    /// advance to the next one or verify and capture.
    async fn complete_challenge(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        let challenge = &self.config.challenge;
        let last = loop {
            if !sleep_or_cancel(challenge.progress_tick, &cancel).await {
                return;
            }
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            let Liveness::Challenging(machine) = &mut session.liveness else {
                return;
            };
            let event = machine.progress_tick();
            self.publish(&session);
            match event {
                ProgressEvent::Advanced(_) => {}
                ProgressEvent::Idle => return,
                ProgressEvent::Completed { last, .. } => break last,
            }
        };

        let pause = if last {
            challenge.verify_pause
        } else {
            challenge.advance_pause
        };
        if !sleep_or_cancel(pause, &cancel).await {
            return;
        }

        let mut session = self.session.lock().await;
        if session.epoch != epoch {
            return;
        }
        let Liveness::Challenging(machine) = &mut session.liveness else {
            return;
        };
        if !last {
            machine.advance(now());
            self.publish(&session);
            return;
        }
        if !machine.mark_verified() {
            return;
        }
        tracing::info!("liveness verified");
        session.stage = Stage::Capturing;
        self.publish(&session);
        drop(session);

        self.capture(epoch, cancel).await;
    }

    // ── Capture and commit ────────────────────────────────────────────────────

    async fn capture(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        if !sleep_or_cancel(self.config.capture_grace, &cancel).await {
            return;
        }
        let frame = self.camera.read().await.grab_frame();

        let epoch = {
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            session.stop_tasks()
        };
        self.camera.write().await.teardown();

        let preview = self.config.preview();
        let quality = self.config.jpeg_quality;
        let encoded = match frame {
            Some(frame) => tokio::task::spawn_blocking(move || {
                StillImage::from_frame(&frame, preview, quality)
            })
            .await
            .map_err(|e| CameraError::Unknown(format!("still encoding task failed: {e}")))
            .and_then(|r| r.map_err(|e| CameraError::Unknown(format!("still encoding failed: {e}")))),
            None => Err(CameraError::NoFrames),
        };

        let job = {
            let mut session = self.session.lock().await;
            if session.epoch != epoch {
                return;
            }
            match encoded {
                Ok(still) => {
                    tracing::info!(width = still.width, height = still.height, "still captured");
                    session.still = Some(HeldStill {
                        still,
                        liveness_verified: true,
                        key: avatar_key(&self.user_id, &Uuid::new_v4()),
                        uploaded_ref: None,
                    });
                    match session.begin_commit() {
                        Ok(job) => {
                            self.publish(&session);
                            job
                        }
                        Err(_) => return,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "capture failed");
                    session.reset_liveness();
                    session.stage = Stage::CameraError(e);
                    self.publish(&session);
                    return;
                }
            }
        };

        if let Err(e) = self.commit(job).await {
            tracing::warn!(error = %e, "commit failed, holding still for retry");
        }
    }

    /// Upload the still, then point the profile at it. On failure the still
    /// is held in [`Stage::Preview`] for a retry.
    async fn commit(&self, job: CommitJob) -> Result<CaptureReceipt, CaptureError> {
        let public_ref = match job.uploaded_ref {
            Some(public_ref) => public_ref,
            None => match self.collab.blobs.put(&job.key, job.jpeg).await {
                Ok(public_ref) => {
                    let mut session = self.session.lock().await;
                    if session.epoch == job.epoch {
                        if let Some(held) = session.still.as_mut() {
                            held.uploaded_ref = Some(public_ref.clone());
                        }
                    }
                    public_ref
                }
                Err(e) => {
                    return Err(self
                        .commit_failed(job.epoch, CaptureError::UploadFailed(e.to_string()))
                        .await)
                }
            },
        };

        if let Err(e) = self
            .collab
            .profiles
            .update_avatar_reference(&self.user_id, &public_ref)
            .await
        {
            return Err(self
                .commit_failed(job.epoch, CaptureError::LinkFailed(e.to_string()))
                .await);
        }

        let receipt = {
            let mut session = self.session.lock().await;
            if session.epoch != job.epoch || session.finished {
                return Err(session.invalid("commit"));
            }
            session.stage = Stage::Done {
                public_ref: public_ref.clone(),
            };
            session.finished = true;
            self.publish(&session);
            CaptureReceipt {
                public_ref,
                liveness_verified: job.liveness_verified,
                session_id: self.session_id,
            }
        };

        tracing::info!(
            public_ref = %receipt.public_ref,
            liveness_verified = receipt.liveness_verified,
            "avatar committed"
        );
        self.listener.on_capture_complete(&receipt);
        Ok(receipt)
    }

    async fn commit_failed(&self, epoch: u64, error: CaptureError) -> CaptureError {
        tracing::warn!(error = %error, "commit failed");
        let mut session = self.session.lock().await;
        if session.epoch == epoch {
            session.stage = Stage::Preview {
                error: error.clone(),
            };
            self.publish(&session);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selfie_core::{FaceLandmarks, Point};

    fn config() -> Config {
        Config::default()
    }

    fn neutral() -> FaceLandmarks {
        FaceLandmarks {
            left_eye: vec![Point::new(80.0, 100.0)],
            right_eye: vec![Point::new(120.0, 100.0)],
            nose: vec![Point::new(100.0, 130.0)],
        }
    }

    fn sample(landmarks: &FaceLandmarks, pose: &mut PoseEstimator, at: Instant) -> PoseSample {
        pose.estimate(landmarks, at).unwrap()
    }

    fn camera_session() -> Session {
        let config = config();
        Session {
            stage: Stage::Camera,
            epoch: 0,
            tasks: CancellationToken::new(),
            models: ModelState::Ready,
            pose: PoseEstimator::new(config.pose.clone()),
            gate: FaceGate::new(config.face_gate_ticks),
            liveness: Liveness::Idle,
            calibrated: None,
            still: None,
            finished: false,
        }
    }

    #[test]
    fn test_face_gate_opens_calibration() {
        let config = config();
        let mut session = camera_session();
        let mut pose = PoseEstimator::new(config.pose.clone());
        let t0 = Instant::now();
        for i in 0..5 {
            let s = sample(&neutral(), &mut pose, t0 + Duration::from_millis(300 * i));
            session.on_pose(s, &config);
            assert_eq!(session.stage, Stage::Camera);
        }
        let s = sample(&neutral(), &mut pose, t0 + Duration::from_millis(1500));
        session.on_pose(s, &config);
        assert_eq!(session.stage, Stage::Calibration);
        assert!(matches!(session.liveness, Liveness::Calibrating(_)));
    }

    #[test]
    fn test_missing_face_resets_gate() {
        let config = config();
        let mut session = camera_session();
        let t0 = Instant::now();
        let mut pose = PoseEstimator::new(config.pose.clone());
        for i in 0..5 {
            let s = sample(&neutral(), &mut pose, t0 + Duration::from_millis(300 * i));
            session.on_pose(s, &config);
        }
        session.on_pose(PoseSample::no_face(t0 + Duration::from_millis(1500)), &config);
        assert_eq!(session.gate.streak(), 0);
        assert_eq!(session.stage, Stage::Camera);
    }

    #[test]
    fn test_stalled_challenge_returns_to_camera() {
        let config = config();
        let mut session = camera_session();
        let mut machine = ChallengeMachine::new(config.challenge.clone());
        let t0 = Instant::now();
        for _ in 0..config.challenge.countdown_ticks {
            machine.countdown_tick(t0);
        }
        session.stage = Stage::Challenge;
        session.liveness = Liveness::Challenging(machine);
        session.calibrated = Some(CalibrationExtremes::default());

        let late = t0 + config.challenge.stall_timeout + Duration::from_millis(1);
        session.on_pose(PoseSample::no_face(late), &config);
        assert_eq!(session.stage, Stage::Camera);
        assert!(matches!(session.liveness, Liveness::Idle));
        assert!(session.calibrated.is_none());
        assert!(session.pose.baseline().is_none());
    }

    #[test]
    fn test_stop_tasks_cancels_and_bumps_epoch() {
        let mut session = camera_session();
        let old = session.tasks.clone();
        assert_eq!(session.stop_tasks(), 1);
        assert!(old.is_cancelled());
        assert!(!session.tasks.is_cancelled());
    }

    #[test]
    fn test_snapshot_reports_calibration_after_done() {
        let mut session = camera_session();
        session.calibrated = Some(CalibrationExtremes {
            left: Some(7.0),
            right: Some(-6.0),
        });
        session.liveness = Liveness::Challenging(ChallengeMachine::new(config().challenge));
        let status = session.snapshot();
        let calibration = status.calibration.unwrap();
        assert_eq!(calibration.phase, selfie_core::CalibrationPhase::Done);
        assert_eq!(calibration.extremes.left, Some(7.0));
        assert_eq!(status.challenge.unwrap().countdown, 3);
    }

    #[test]
    fn test_begin_commit_requires_still() {
        let mut session = camera_session();
        let err = session.begin_commit().err().unwrap();
        assert!(matches!(err, CaptureError::InvalidStage { action: "commit", .. }));
    }
}
