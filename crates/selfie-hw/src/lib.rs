//! selfie-hw: camera lifecycle and frame-health supervision.
//!
//! [`CameraSession`] owns one platform stream at a time and only reports
//! success once decoded frames are observed. [`FrameWatchdog`] polls the
//! session's health signals and restarts it, within a budget, when frames
//! stop arriving.

pub mod camera;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod media;
pub mod watchdog;

pub use camera::{CameraError, CameraSession, HealthSignals, PlaybackConfig, PlaybackState};
pub use media::{
    Constraints, FacingMode, FormFactor, Frame, MediaBackend, MediaStream, PlatformFailure,
    PlayFailure, SinkOptions, TrackEvent, TrackState,
};
pub use watchdog::{CameraHealth, FrameWatchdog, WatchdogConfig, WatchdogVerdict};
