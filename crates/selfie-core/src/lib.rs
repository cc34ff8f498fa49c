//! selfie-core: head-pose estimation and liveness state machines.
//!
//! Everything in this crate is synchronous and clock-agnostic: callers pass
//! the sample instant in, so the machines can be driven by the capture
//! controller's timers or by tests without a runtime.

pub mod calibration;
pub mod challenge;
pub mod gate;
pub mod pose;
pub mod types;

pub use calibration::{
    CalibrationConfig, CalibrationEvent, CalibrationExtremes, CalibrationMachine, CalibrationPhase,
};
pub use challenge::{
    ChallengeConfig, ChallengeEvent, ChallengeKind, ChallengeMachine, PhaseFlags, ProgressEvent,
};
pub use gate::FaceGate;
pub use pose::{visual_direction, PoseConfig, PoseEstimator, PreviewOrientation, VisualDirection};
pub use types::{FaceLandmarks, Point, PoseSample};
