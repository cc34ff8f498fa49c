//! selfie-capture: liveness-gated selfie capture.
//!
//! [`CaptureController`] drives one attempt: it opens the camera and loads
//! the landmark model, waits for a stable face, runs directed-turn
//! calibration and the nod challenge, grabs and encodes the still, and
//! commits it through [`BlobStorage`] and [`ProfileStore`].

pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod status;
pub mod still;
pub mod storage;
pub mod store;

pub use config::Config;
pub use controller::{CaptureController, CaptureListener, CaptureReceipt, Collaborators};
pub use detector::{verify_model_files, DetectorError, LandmarkDetector};
pub use error::CaptureError;
pub use status::{CalibrationStatus, CaptureStatus, ChallengeStatus, Stage, StageKind};
pub use still::StillImage;
pub use storage::{avatar_key, BlobStorage, ProfileStore, StorageError};
pub use store::{AvatarInfo, SqliteAvatarStore, StoreError};
