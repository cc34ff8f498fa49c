//! Camera session lifecycle.
//!
//! Acquisition, binding to a playback sink, frame readiness and teardown,
//! with platform failures mapped onto [`CameraError`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{
    Constraints, Frame, MediaBackend, MediaStream, PlatformFailure, PlayFailure, SinkOptions,
    TrackEvent, TrackState,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no camera found")]
    NoCameraFound,
    #[error("camera is busy or unreadable")]
    CameraBusy,
    #[error("camera cannot satisfy the requested constraints")]
    ConstraintsUnsatisfiable,
    #[error("camera produced no frames before the readiness timeout")]
    NoFrames,
    #[error("camera stalled and did not recover after {restarts} restarts")]
    CameraUnrecoverable { restarts: u32 },
    #[error("camera error: {0}")]
    Unknown(String),
}

impl From<PlatformFailure> for CameraError {
    fn from(failure: PlatformFailure) -> Self {
        match failure {
            PlatformFailure::NotAllowed | PlatformFailure::Security => CameraError::PermissionDenied,
            PlatformFailure::NotFound => CameraError::NoCameraFound,
            PlatformFailure::DeviceInUse | PlatformFailure::NotReadable => CameraError::CameraBusy,
            PlatformFailure::Overconstrained { .. } => CameraError::ConstraintsUnsatisfiable,
            PlatformFailure::Aborted(msg) | PlatformFailure::Other(msg) => CameraError::Unknown(msg),
        }
    }
}

/// Outcome of binding a stream to its sink and starting playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Decoded frames observed.
    Playing,
    /// Playback started but no decoded frame arrived within the timeout.
    NoFrames,
    /// The platform requires a user gesture; call
    /// [`CameraSession::request_manual_play`] from one.
    AutoplayBlocked,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PlaybackConfig {
    /// How long to wait for the first decoded frame after `play()` resolves.
    pub frame_timeout: Duration,
    /// Readiness polling period while waiting.
    pub readiness_poll: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(4500),
            readiness_poll: Duration::from_millis(50),
        }
    }
}

/// What the watchdog is allowed to see of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSignals {
    pub dimensions: (u32, u32),
    /// `None` when no stream is held.
    pub track: Option<TrackState>,
}

impl HealthSignals {
    pub fn is_healthy(&self) -> bool {
        self.dimensions.0 > 0 && self.dimensions.1 > 0 && self.track == Some(TrackState::Live)
    }
}

/// Owns the media stream and its playback sink.
///
/// A session is either playing with confirmed decoded frames, or it reports
/// a typed [`CameraError`] / [`PlaybackState`]. The stream handle is only
/// touched through these methods.
pub struct CameraSession {
    backend: Arc<dyn MediaBackend>,
    config: PlaybackConfig,
    stream: Option<Box<dyn MediaStream>>,
    playing: bool,
    events_tx: mpsc::UnboundedSender<TrackEvent>,
}

impl CameraSession {
    pub fn new(backend: Arc<dyn MediaBackend>, config: PlaybackConfig) -> Self {
        // Nobody listens until a watchdog takes the receiver.
        let (events_tx, _) = mpsc::unbounded_channel();
        Self {
            backend,
            config,
            stream: None,
            playing: false,
            events_tx,
        }
    }

    /// Request a stream. On `ConstraintsUnsatisfiable` retries once with an
    /// unconstrained request before giving up. Any previous stream is torn
    /// down first.
    pub async fn acquire(&mut self, constraints: &Constraints) -> Result<(), CameraError> {
        self.teardown();

        let stream = match self.backend.acquire(constraints).await {
            Ok(stream) => stream,
            Err(failure) => {
                let err = CameraError::from(failure);
                if err != CameraError::ConstraintsUnsatisfiable || constraints.is_unconstrained() {
                    tracing::warn!(error = %err, "camera acquire failed");
                    return Err(err);
                }
                tracing::info!("constraints unsatisfiable, retrying unconstrained");
                self.backend
                    .acquire(&Constraints::unconstrained())
                    .await
                    .map_err(|failure| {
                        let err = CameraError::from(failure);
                        tracing::warn!(error = %err, "unconstrained camera acquire failed");
                        err
                    })?
            }
        };

        stream.set_track_listener(self.events_tx.clone());
        self.stream = Some(stream);
        tracing::info!(?constraints, "camera stream acquired");
        Ok(())
    }

    /// Attach the stream to a silent inline autoplaying sink and start
    /// playback. Resolves to `Playing` only once non-zero intrinsic
    /// dimensions and decode readiness are observed.
    pub async fn bind_and_play(&mut self) -> Result<PlaybackState, CameraError> {
        self.playing = false;
        let stream = self
            .stream
            .as_deref()
            .ok_or_else(|| CameraError::Unknown("no camera stream acquired".to_string()))?;

        stream.attach_sink(SinkOptions::silent_inline());
        match stream.play().await {
            Ok(()) => {}
            Err(PlayFailure::AutoplayBlocked) => {
                tracing::info!("autoplay blocked, waiting for user gesture");
                return Ok(PlaybackState::AutoplayBlocked);
            }
            Err(PlayFailure::Other(msg)) => return Err(CameraError::Unknown(msg)),
        }

        let poll = self.config.readiness_poll;
        let ready = tokio::time::timeout(self.config.frame_timeout, async {
            loop {
                let (w, h) = stream.video_dimensions();
                if w > 0 && h > 0 && stream.decode_ready() {
                    return (w, h);
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match ready {
            Ok((width, height)) => {
                self.playing = true;
                tracing::info!(width, height, "camera playing");
                Ok(PlaybackState::Playing)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.frame_timeout.as_millis() as u64,
                    "no decoded frames before timeout"
                );
                Ok(PlaybackState::NoFrames)
            }
        }
    }

    /// Retry playback from inside a user-gesture context.
    pub async fn request_manual_play(&mut self) -> Result<PlaybackState, CameraError> {
        self.bind_and_play().await
    }

    /// Acquire and play. A first `NoFrames` is retried once with an
    /// unconstrained stream; a second one is surfaced as an error.
    pub async fn start(&mut self, constraints: &Constraints) -> Result<PlaybackState, CameraError> {
        self.acquire(constraints).await?;
        match self.bind_and_play().await? {
            PlaybackState::NoFrames => {
                tracing::info!("no frames on first attempt, reacquiring unconstrained");
                self.acquire(&Constraints::unconstrained()).await?;
                match self.bind_and_play().await? {
                    PlaybackState::NoFrames => {
                        self.teardown();
                        Err(CameraError::NoFrames)
                    }
                    other => Ok(other),
                }
            }
            other => Ok(other),
        }
    }

    /// Tear down and reacquire with loosened constraints.
    pub async fn restart(&mut self) -> Result<PlaybackState, CameraError> {
        self.teardown();
        self.acquire(&Constraints::unconstrained()).await?;
        self.bind_and_play().await
    }

    /// Stop all tracks and detach the sink. Safe to call in any state.
    pub fn teardown(&mut self) {
        self.playing = false;
        if let Some(stream) = self.stream.take() {
            stream.stop();
            tracing::info!("camera torn down");
        }
    }

    /// Take a receiver for hardware track events. Replaces any previous
    /// receiver.
    pub fn take_track_events(&mut self) -> mpsc::UnboundedReceiver<TrackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stream) = self.stream.as_deref() {
            stream.set_track_listener(tx.clone());
        }
        self.events_tx = tx;
        rx
    }

    pub fn health_signals(&self) -> HealthSignals {
        match self.stream.as_deref() {
            Some(stream) => HealthSignals {
                dimensions: stream.video_dimensions(),
                track: Some(stream.track_state()),
            },
            None => HealthSignals {
                dimensions: (0, 0),
                track: None,
            },
        }
    }

    /// Current frame, only while playing.
    pub fn grab_frame(&self) -> Option<Frame> {
        if !self.playing {
            return None;
        }
        self.stream.as_deref().and_then(|s| s.grab_frame())
    }

    pub fn is_active(&self) -> bool {
        self.playing && self.stream.is_some()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCamera;
    use crate::media::{FacingMode, FormFactor};

    fn session(cam: &FakeCamera) -> CameraSession {
        CameraSession::new(Arc::new(cam.clone()), PlaybackConfig::default())
    }

    #[test]
    fn test_platform_failure_mapping() {
        assert_eq!(CameraError::from(PlatformFailure::NotAllowed), CameraError::PermissionDenied);
        assert_eq!(CameraError::from(PlatformFailure::Security), CameraError::PermissionDenied);
        assert_eq!(CameraError::from(PlatformFailure::NotFound), CameraError::NoCameraFound);
        assert_eq!(CameraError::from(PlatformFailure::DeviceInUse), CameraError::CameraBusy);
        assert_eq!(CameraError::from(PlatformFailure::NotReadable), CameraError::CameraBusy);
        assert_eq!(
            CameraError::from(PlatformFailure::Overconstrained {
                constraint: "width".into()
            }),
            CameraError::ConstraintsUnsatisfiable
        );
        assert_eq!(
            CameraError::from(PlatformFailure::Other("boom".into())),
            CameraError::Unknown("boom".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_plays_once_frames_decoded() {
        let cam = FakeCamera::new();
        let mut s = session(&cam);
        let state = s
            .start(&Constraints::for_form_factor(FormFactor::Handheld))
            .await
            .unwrap();
        assert_eq!(state, PlaybackState::Playing);
        assert!(s.is_active());
        assert!(s.grab_frame().is_some());
        assert_eq!(cam.acquisitions()[0].facing, Some(FacingMode::User));
        assert_eq!(cam.sinks(), vec![SinkOptions::silent_inline()]);
        let sink = cam.sinks()[0];
        assert!(sink.muted && sink.inline && sink.autoplay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_resolving_early_waits_for_dimensions() {
        // play() resolves immediately but dimensions only appear 50 ms later
        let cam = FakeCamera::new().with_frame_delay(Duration::from_millis(50));
        let mut s = session(&cam);
        s.acquire(&Constraints::unconstrained()).await.unwrap();

        let started = tokio::time::Instant::now();
        let state = s.bind_and_play().await.unwrap();
        assert_eq!(state, PlaybackState::Playing);
        assert!(started.elapsed() >= Duration::from_millis(50));
        let (w, h) = s.health_signals().dimensions;
        assert!(w > 0 && h > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_dimensions_times_out_as_no_frames() {
        let cam = FakeCamera::new().without_frames();
        let mut s = session(&cam);
        s.acquire(&Constraints::unconstrained()).await.unwrap();
        let state = s.bind_and_play().await.unwrap();
        assert_eq!(state, PlaybackState::NoFrames);
        assert!(!s.is_active());
        assert!(s.grab_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_no_frames_once_then_fails() {
        let cam = FakeCamera::new().without_frames();
        let mut s = session(&cam);
        let err = s
            .start(&Constraints::for_form_factor(FormFactor::Handheld))
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::NoFrames);
        let acquisitions = cam.acquisitions();
        assert_eq!(acquisitions.len(), 2);
        assert!(acquisitions[1].is_unconstrained());
        assert!(!s.has_stream());
    }

    #[tokio::test]
    async fn test_overconstrained_retries_unconstrained_once() {
        let cam = FakeCamera::new();
        cam.push_acquire_failure(PlatformFailure::Overconstrained {
            constraint: "facingMode".into(),
        });
        let mut s = session(&cam);
        s.acquire(&Constraints::for_form_factor(FormFactor::Handheld))
            .await
            .unwrap();
        let acquisitions = cam.acquisitions();
        assert_eq!(acquisitions.len(), 2);
        assert!(acquisitions[1].is_unconstrained());
    }

    #[tokio::test]
    async fn test_overconstrained_twice_surfaces() {
        let cam = FakeCamera::new();
        let failure = PlatformFailure::Overconstrained {
            constraint: "width".into(),
        };
        cam.push_acquire_failure(failure.clone());
        cam.push_acquire_failure(failure);
        let mut s = session(&cam);
        let err = s
            .acquire(&Constraints::for_form_factor(FormFactor::Handheld))
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::ConstraintsUnsatisfiable);
        assert_eq!(cam.acquisitions().len(), 2);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let cam = FakeCamera::new();
        cam.push_acquire_failure(PlatformFailure::NotAllowed);
        let mut s = session(&cam);
        let err = s
            .acquire(&Constraints::for_form_factor(FormFactor::Handheld))
            .await
            .unwrap_err();
        assert_eq!(err, CameraError::PermissionDenied);
        assert_eq!(cam.acquisitions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_blocked_then_manual_play() {
        let cam = FakeCamera::new();
        cam.push_play_failure(PlayFailure::AutoplayBlocked);
        let mut s = session(&cam);
        let state = s.start(&Constraints::unconstrained()).await.unwrap();
        assert_eq!(state, PlaybackState::AutoplayBlocked);
        assert!(!s.is_active());

        let state = s.request_manual_play().await.unwrap();
        assert_eq!(state, PlaybackState::Playing);
        assert!(s.is_active());
        // rebinding uses the same silent inline sink
        assert_eq!(cam.sinks(), vec![SinkOptions::silent_inline(); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let cam = FakeCamera::new();
        let mut s = session(&cam);
        s.start(&Constraints::unconstrained()).await.unwrap();
        s.teardown();
        s.teardown();
        assert_eq!(cam.stop_count(), 1);
        assert!(!s.is_active());
        assert_eq!(s.health_signals().track, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_events_forwarded() {
        let cam = FakeCamera::new();
        let mut s = session(&cam);
        s.start(&Constraints::unconstrained()).await.unwrap();
        let mut events = s.take_track_events();
        cam.end_track();
        assert_eq!(events.recv().await, Some(TrackEvent::Ended));
        assert!(!s.health_signals().is_healthy());
    }
}
