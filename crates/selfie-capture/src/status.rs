//! Observable session state.

use selfie_core::{CalibrationExtremes, CalibrationPhase, PhaseFlags};
use selfie_hw::CameraError;

use crate::error::CaptureError;

/// Where a capture session is. Exactly one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for the user to start.
    Instructions,
    /// Camera acquisition and model load in flight.
    ModelLoading,
    /// Stream acquired but the platform wants a user gesture to play.
    AwaitingPlayGesture,
    /// Live preview, waiting for a stable face.
    Camera,
    Calibration,
    Challenge,
    /// Liveness verified; grabbing the still.
    Capturing,
    Committing,
    /// Still held after a failed commit; retry or retake.
    Preview { error: CaptureError },
    CameraError(CameraError),
    Done { public_ref: String },
    Cancelled,
    Skipped,
}

/// Payload-free [`Stage`] discriminant, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Instructions,
    ModelLoading,
    AwaitingPlayGesture,
    Camera,
    Calibration,
    Challenge,
    Capturing,
    Committing,
    Preview,
    CameraError,
    Done,
    Cancelled,
    Skipped,
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Instructions => StageKind::Instructions,
            Stage::ModelLoading => StageKind::ModelLoading,
            Stage::AwaitingPlayGesture => StageKind::AwaitingPlayGesture,
            Stage::Camera => StageKind::Camera,
            Stage::Calibration => StageKind::Calibration,
            Stage::Challenge => StageKind::Challenge,
            Stage::Capturing => StageKind::Capturing,
            Stage::Committing => StageKind::Committing,
            Stage::Preview { .. } => StageKind::Preview,
            Stage::CameraError(_) => StageKind::CameraError,
            Stage::Done { .. } => StageKind::Done,
            Stage::Cancelled => StageKind::Cancelled,
            Stage::Skipped => StageKind::Skipped,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done { .. } | Stage::Cancelled | Stage::Skipped)
    }
}

/// Snapshot published to observers after every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStatus {
    pub stage: Stage,
    /// Consecutive face-present ticks while waiting in `Camera`.
    pub face_streak: u32,
    /// [`CaptureError::ModelLoadFailed`] while the landmark model is
    /// unavailable; the preview runs but cannot progress past face gating.
    pub model_error: Option<CaptureError>,
    /// Pitch baseline established by the first detected face.
    pub pitch_baseline: Option<f32>,
    pub calibration: Option<CalibrationStatus>,
    pub challenge: Option<ChallengeStatus>,
    /// A still is held (preview, committing, or done).
    pub has_still: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationStatus {
    pub phase: CalibrationPhase,
    pub hold_count: u32,
    pub extremes: CalibrationExtremes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeStatus {
    pub index: usize,
    /// Countdown seconds left; zero once armed.
    pub countdown: u8,
    pub armed: bool,
    pub flags: PhaseFlags,
    /// Completion animation, 0-100.
    pub progress: u8,
    pub completed: Vec<bool>,
    pub verified: bool,
}

impl CaptureStatus {
    pub(crate) fn initial() -> Self {
        Self {
            stage: Stage::Instructions,
            face_streak: 0,
            model_error: None,
            pitch_baseline: None,
            calibration: None,
            challenge: None,
            has_still: false,
        }
    }
}
