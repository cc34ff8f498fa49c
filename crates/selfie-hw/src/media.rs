//! Platform media contracts consumed by [`CameraSession`](crate::CameraSession).
//!
//! A backend hands out video-only streams. Each stream doubles as its own
//! playback sink: it can be configured, played, queried for decoded frame
//! dimensions, and stopped.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A decoded video frame.
pub type Frame = image::RgbImage;

/// Device class the capture runs on. Drives default stream constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    Handheld,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Front camera.
    User,
    Environment,
}

/// Requested stream properties. All fields are hints; `None` leaves the
/// choice to the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    pub facing: Option<FacingMode>,
    pub ideal_resolution: Option<(u32, u32)>,
}

/// Target resolution requested on handheld devices.
pub const HANDHELD_IDEAL_RESOLUTION: (u32, u32) = (1280, 720);

impl Constraints {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    /// Front camera plus a target resolution on handheld devices,
    /// unconstrained elsewhere.
    pub fn for_form_factor(form_factor: FormFactor) -> Self {
        match form_factor {
            FormFactor::Handheld => Self {
                facing: Some(FacingMode::User),
                ideal_resolution: Some(HANDHELD_IDEAL_RESOLUTION),
            },
            FormFactor::Desktop => Self::unconstrained(),
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.facing.is_none() && self.ideal_resolution.is_none()
    }
}

/// Failure reported by the platform when a stream is requested.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformFailure {
    #[error("access to the camera was not allowed")]
    NotAllowed,
    #[error("camera access blocked by security policy")]
    Security,
    #[error("no video input device")]
    NotFound,
    #[error("video device in use")]
    DeviceInUse,
    #[error("video device could not be read")]
    NotReadable,
    #[error("constraint cannot be satisfied: {constraint}")]
    Overconstrained { constraint: String },
    #[error("acquisition aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayFailure {
    /// The platform refuses to start playback outside a user gesture.
    #[error("autoplay blocked")]
    AutoplayBlocked,
    #[error("playback failed: {0}")]
    Other(String),
}

/// Playback sink settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    pub muted: bool,
    pub inline: bool,
    pub autoplay: bool,
}

impl SinkOptions {
    /// Silent, inline, autoplaying. The only configuration the session uses.
    pub const fn silent_inline() -> Self {
        Self {
            muted: true,
            inline: true,
            autoplay: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Muted,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    Ended,
    Muted,
    Unmuted,
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Request a video-only stream.
    async fn acquire(&self, constraints: &Constraints)
        -> Result<Box<dyn MediaStream>, PlatformFailure>;
}

#[async_trait]
pub trait MediaStream: Send + Sync {
    /// Bind the stream to its playback sink.
    fn attach_sink(&self, options: SinkOptions);

    /// Start playback. May resolve before any frame is decoded.
    async fn play(&self) -> Result<(), PlayFailure>;

    /// Intrinsic dimensions of the decoded video; `(0, 0)` until the first
    /// frame is available.
    fn video_dimensions(&self) -> (u32, u32);

    /// Whether the sink has decoded data for the current position.
    fn decode_ready(&self) -> bool;

    fn track_state(&self) -> TrackState;

    /// Route hardware track events (ended, muted) to `listener`.
    fn set_track_listener(&self, listener: mpsc::UnboundedSender<TrackEvent>);

    /// Copy the current frame out of the sink.
    fn grab_frame(&self) -> Option<Frame>;

    /// Stop every track and detach the sink.
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handheld_constraints() {
        let c = Constraints::for_form_factor(FormFactor::Handheld);
        assert_eq!(c.facing, Some(FacingMode::User));
        assert_eq!(c.ideal_resolution, Some(HANDHELD_IDEAL_RESOLUTION));
        assert!(!c.is_unconstrained());
    }

    #[test]
    fn test_desktop_constraints_are_open() {
        assert!(Constraints::for_form_factor(FormFactor::Desktop).is_unconstrained());
    }
}
