//! Head pose from eye and nose landmarks.
//!
//! Yaw comes from the asymmetry of the nose-to-eye distances: with the head
//! centred the nose tip sits equally far from both eye centres. Turning the
//! head pulls the nose toward one eye, and the distance ratio drifts away
//! from 1.
//!
//! Pitch is not an angle. It is the vertical offset of the nose tip below the
//! eye midpoint, reported relative to the first sample of the session. The
//! baseline is captured once per capture session and cleared on retake.

use std::time::Instant;

use crate::types::{FaceLandmarks, PoseSample};

/// Yaw estimates are clamped to this magnitude (degrees).
pub const YAW_LIMIT_DEG: f32 = 45.0;

/// Below this nose-to-right-eye distance (pixels) the ratio is meaningless.
const MIN_EYE_DISTANCE: f32 = 1e-3;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PoseConfig {
    /// Degrees of yaw per unit of distance-ratio deviation.
    pub yaw_scale: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self { yaw_scale: 50.0 }
    }
}

/// How the live preview is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PreviewOrientation {
    /// Horizontally flipped, like a mirror. The usual selfie preview.
    Mirrored,
    /// Raw sensor orientation.
    Raw,
}

/// Direction of a head turn as the user perceives it on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum VisualDirection {
    Left,
    Right,
}

/// Map a raw yaw sign to the on-screen direction of the turn.
///
/// Positive yaw means the nose moved toward the eye on the right of the raw
/// frame, i.e. the subject turned toward their own left. A mirrored preview
/// shows that as a turn to the left of the screen; a raw preview shows it to
/// the right. Zero yaw has no direction.
pub fn visual_direction(yaw_deg: f32, preview: PreviewOrientation) -> Option<VisualDirection> {
    if yaw_deg == 0.0 || yaw_deg.is_nan() {
        return None;
    }
    let toward_subject_left = yaw_deg > 0.0;
    let dir = match (preview, toward_subject_left) {
        (PreviewOrientation::Mirrored, true) | (PreviewOrientation::Raw, false) => {
            VisualDirection::Left
        }
        (PreviewOrientation::Mirrored, false) | (PreviewOrientation::Raw, true) => {
            VisualDirection::Right
        }
    };
    Some(dir)
}

/// Per-session pose estimator. Owns the pitch baseline.
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    config: PoseConfig,
    baseline: Option<f32>,
}

impl PoseEstimator {
    pub fn new(config: PoseConfig) -> Self {
        Self {
            config,
            baseline: None,
        }
    }

    /// Derive a pose sample from one set of landmarks.
    ///
    /// Returns `None` when the landmark clusters are empty or degenerate.
    /// The first successful sample fixes the pitch baseline.
    pub fn estimate(&mut self, landmarks: &FaceLandmarks, at: Instant) -> Option<PoseSample> {
        let left = landmarks.left_eye_center()?;
        let right = landmarks.right_eye_center()?;
        let nose = landmarks.nose_tip()?;

        let to_left = nose.distance(&left);
        let to_right = nose.distance(&right);
        if to_right < MIN_EYE_DISTANCE {
            return None;
        }

        let ratio = to_left / to_right;
        let yaw_deg = ((ratio - 1.0) * self.config.yaw_scale).clamp(-YAW_LIMIT_DEG, YAW_LIMIT_DEG);
        if !yaw_deg.is_finite() {
            return None;
        }

        let eye_mid_y = (left.y + right.y) / 2.0;
        let raw_pitch = nose.y - eye_mid_y;
        let baseline = *self.baseline.get_or_insert_with(|| {
            tracing::debug!(baseline = raw_pitch, "pitch baseline established");
            raw_pitch
        });

        Some(PoseSample {
            yaw_deg,
            pitch_delta: raw_pitch - baseline,
            timestamp: at,
            face_found: true,
        })
    }

    /// Forget the pitch baseline; the next sample re-establishes it.
    pub fn reset_baseline(&mut self) {
        self.baseline = None;
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;

    /// Eyes 40 px apart at y=100, nose at (nose_x, nose_y).
    fn face(nose_x: f32, nose_y: f32) -> FaceLandmarks {
        FaceLandmarks {
            left_eye: vec![Point::new(80.0, 100.0)],
            right_eye: vec![Point::new(120.0, 100.0)],
            nose: vec![Point::new(nose_x, nose_y)],
        }
    }

    #[test]
    fn test_centered_face_has_zero_yaw() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let s = est.estimate(&face(100.0, 130.0), Instant::now()).unwrap();
        assert!(s.yaw_deg.abs() < 1e-4);
        assert!(s.face_found);
    }

    #[test]
    fn test_nose_toward_right_eye_is_positive_yaw() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let s = est.estimate(&face(110.0, 100.0), Instant::now()).unwrap();
        // ratio = 30 / 10 = 3 -> (3 - 1) * 50 = 100 -> clamped
        assert_eq!(s.yaw_deg, YAW_LIMIT_DEG);

        let s = est.estimate(&face(98.0, 100.0), Instant::now()).unwrap();
        // ratio = 18 / 22
        let expected = (18.0 / 22.0 - 1.0) * 50.0;
        assert!((s.yaw_deg - expected).abs() < 1e-4);
        assert!(s.yaw_deg < 0.0);
    }

    #[test]
    fn test_first_sample_sets_pitch_baseline() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let now = Instant::now();
        let first = est.estimate(&face(100.0, 130.0), now).unwrap();
        assert_eq!(first.pitch_delta, 0.0);

        let up = est.estimate(&face(100.0, 122.0), now).unwrap();
        assert!((up.pitch_delta + 8.0).abs() < 1e-4);

        let down = est.estimate(&face(100.0, 137.0), now).unwrap();
        assert!((down.pitch_delta - 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_reset_baseline_reestablishes_zero() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let now = Instant::now();
        est.estimate(&face(100.0, 130.0), now).unwrap();
        assert_eq!(est.baseline(), Some(30.0));

        est.reset_baseline();
        assert_eq!(est.baseline(), None);
        let s = est.estimate(&face(100.0, 150.0), now).unwrap();
        assert_eq!(s.pitch_delta, 0.0);
        assert_eq!(est.baseline(), Some(50.0));
    }

    #[test]
    fn test_degenerate_landmarks_rejected() {
        let mut est = PoseEstimator::new(PoseConfig::default());
        let empty = FaceLandmarks {
            left_eye: vec![],
            right_eye: vec![Point::new(1.0, 1.0)],
            nose: vec![Point::new(1.0, 1.0)],
        };
        assert!(est.estimate(&empty, Instant::now()).is_none());
        // nose exactly on the right eye
        assert!(est.estimate(&face(120.0, 100.0), Instant::now()).is_none());
        assert_eq!(est.baseline(), None);
    }

    #[test]
    fn test_visual_direction_mapping() {
        use PreviewOrientation::*;
        assert_eq!(visual_direction(10.0, Mirrored), Some(VisualDirection::Left));
        assert_eq!(visual_direction(-10.0, Mirrored), Some(VisualDirection::Right));
        assert_eq!(visual_direction(10.0, Raw), Some(VisualDirection::Right));
        assert_eq!(visual_direction(-10.0, Raw), Some(VisualDirection::Left));
        assert_eq!(visual_direction(0.0, Mirrored), None);
    }
}
