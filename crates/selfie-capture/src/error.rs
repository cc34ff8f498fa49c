use selfie_hw::CameraError;
use thiserror::Error;

use crate::status::StageKind;

/// Everything a capture session can report to its caller.
///
/// Each variant maps to one user-visible state: camera errors to the
/// camera-error screen, commit failures to the preview with a retry, and
/// model failures to a preview that cannot progress.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("landmark model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("failed to link avatar to profile: {0}")]
    LinkFailed(String),

    #[error("image could not be processed: {0}")]
    Image(String),

    #[error("{action} is not available while {stage:?}")]
    InvalidStage {
        action: &'static str,
        stage: StageKind,
    },
}

impl From<image::ImageError> for CaptureError {
    fn from(e: image::ImageError) -> Self {
        CaptureError::Image(e.to_string())
    }
}
