//! Scriptable in-memory camera for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::{
    Constraints, Frame, MediaBackend, MediaStream, PlatformFailure, PlayFailure, SinkOptions,
    TrackEvent, TrackState,
};

const DEFAULT_DIMENSIONS: (u32, u32) = (64, 48);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeState {
    acquire_failures: VecDeque<PlatformFailure>,
    play_failures: VecDeque<PlayFailure>,
    /// `None`: playback never produces frames.
    frame_delay: Option<Duration>,
    frame: Frame,
    acquisitions: Vec<Constraints>,
    sinks: Vec<SinkOptions>,
    stops: u32,
    current: Option<Arc<FakeTrack>>,
}

struct FakeTrack {
    dims: Mutex<(u32, u32)>,
    ready: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<TrackState>,
    listener: Mutex<Option<mpsc::UnboundedSender<TrackEvent>>>,
    frame: Frame,
}

impl FakeTrack {
    fn show_frames(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        *lock(&self.dims) = (self.frame.width(), self.frame.height());
        self.ready.store(true, Ordering::SeqCst);
    }

    fn hide_frames(&self) {
        *lock(&self.dims) = (0, 0);
        self.ready.store(false, Ordering::SeqCst);
    }

    fn emit(&self, state: TrackState, event: TrackEvent) {
        *lock(&self.state) = state;
        if let Some(listener) = lock(&self.listener).as_ref() {
            let _ = listener.send(event);
        }
    }
}

/// Camera backend whose behaviour is scripted by the test.
///
/// Cloning shares state, so a test keeps one handle for control while the
/// session owns another.
#[derive(Clone)]
pub struct FakeCamera {
    inner: Arc<Mutex<FakeState>>,
}

impl Default for FakeCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCamera {
    pub fn new() -> Self {
        let (w, h) = DEFAULT_DIMENSIONS;
        let frame = Frame::from_fn(w, h, |x, y| image::Rgb([(x * 4) as u8, (y * 5) as u8, 128]));
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                acquire_failures: VecDeque::new(),
                play_failures: VecDeque::new(),
                frame_delay: Some(Duration::ZERO),
                frame,
                acquisitions: Vec::new(),
                sinks: Vec::new(),
                stops: 0,
                current: None,
            })),
        }
    }

    /// Decoded frames appear this long after `play()` resolves.
    pub fn with_frame_delay(self, delay: Duration) -> Self {
        lock(&self.inner).frame_delay = Some(delay);
        self
    }

    /// Playback resolves but never decodes a frame.
    pub fn without_frames(self) -> Self {
        lock(&self.inner).frame_delay = None;
        self
    }

    pub fn with_frame(self, frame: Frame) -> Self {
        lock(&self.inner).frame = frame;
        self
    }

    /// Whether future playbacks produce frames.
    pub fn set_produce_frames(&self, produce: bool) {
        lock(&self.inner).frame_delay = produce.then_some(Duration::ZERO);
    }

    /// Future playbacks decode their first frame after `delay`.
    pub fn set_frame_delay(&self, delay: Duration) {
        lock(&self.inner).frame_delay = Some(delay);
    }

    pub fn push_acquire_failure(&self, failure: PlatformFailure) {
        lock(&self.inner).acquire_failures.push_back(failure);
    }

    pub fn push_play_failure(&self, failure: PlayFailure) {
        lock(&self.inner).play_failures.push_back(failure);
    }

    pub fn acquisitions(&self) -> Vec<Constraints> {
        lock(&self.inner).acquisitions.clone()
    }

    pub fn sinks(&self) -> Vec<SinkOptions> {
        lock(&self.inner).sinks.clone()
    }

    pub fn stop_count(&self) -> u32 {
        lock(&self.inner).stops
    }

    fn current(&self) -> Option<Arc<FakeTrack>> {
        lock(&self.inner).current.clone()
    }

    /// The live track keeps running but stops delivering frames.
    pub fn stall(&self) {
        if let Some(track) = self.current() {
            track.hide_frames();
        }
    }

    pub fn end_track(&self) {
        if let Some(track) = self.current() {
            track.hide_frames();
            track.emit(TrackState::Ended, TrackEvent::Ended);
        }
    }

    pub fn mute_track(&self) {
        if let Some(track) = self.current() {
            track.emit(TrackState::Muted, TrackEvent::Muted);
        }
    }
}

#[async_trait]
impl MediaBackend for FakeCamera {
    async fn acquire(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn MediaStream>, PlatformFailure> {
        let mut state = lock(&self.inner);
        state.acquisitions.push(constraints.clone());
        if let Some(failure) = state.acquire_failures.pop_front() {
            return Err(failure);
        }
        let track = Arc::new(FakeTrack {
            dims: Mutex::new((0, 0)),
            ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            state: Mutex::new(TrackState::Live),
            listener: Mutex::new(None),
            frame: state.frame.clone(),
        });
        state.current = Some(Arc::clone(&track));
        Ok(Box::new(FakeStream {
            track,
            camera: Arc::clone(&self.inner),
        }))
    }
}

struct FakeStream {
    track: Arc<FakeTrack>,
    camera: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl MediaStream for FakeStream {
    fn attach_sink(&self, options: SinkOptions) {
        lock(&self.camera).sinks.push(options);
    }

    async fn play(&self) -> Result<(), PlayFailure> {
        let delay = {
            let mut state = lock(&self.camera);
            if let Some(failure) = state.play_failures.pop_front() {
                return Err(failure);
            }
            state.frame_delay
        };
        match delay {
            Some(d) if d.is_zero() => self.track.show_frames(),
            Some(d) => {
                let track = Arc::clone(&self.track);
                tokio::spawn(async move {
                    tokio::time::sleep(d).await;
                    track.show_frames();
                });
            }
            None => {}
        }
        Ok(())
    }

    fn video_dimensions(&self) -> (u32, u32) {
        *lock(&self.track.dims)
    }

    fn decode_ready(&self) -> bool {
        self.track.ready.load(Ordering::SeqCst)
    }

    fn track_state(&self) -> TrackState {
        *lock(&self.track.state)
    }

    fn set_track_listener(&self, listener: mpsc::UnboundedSender<TrackEvent>) {
        *lock(&self.track.listener) = Some(listener);
    }

    fn grab_frame(&self) -> Option<Frame> {
        let (w, h) = self.video_dimensions();
        (w > 0 && h > 0).then(|| self.track.frame.clone())
    }

    fn stop(&self) {
        self.track.stopped.store(true, Ordering::SeqCst);
        self.track.hide_frames();
        *lock(&self.track.state) = TrackState::Ended;
        lock(&self.camera).stops += 1;
    }
}
