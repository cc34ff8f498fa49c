//! Directed head-turn calibration.
//!
//! The user turns left, then right. Each phase needs a run of consecutive
//! qualifying samples; any sample that does not qualify (wrong direction,
//! under threshold, or no face) resets the run. The extremes reached are
//! recorded for diagnostics only.

use std::time::{Duration, Instant};

use crate::pose::{visual_direction, PreviewOrientation, VisualDirection};
use crate::types::PoseSample;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CalibrationConfig {
    /// Minimum |yaw| (degrees) for a sample to count toward a phase.
    pub threshold_deg: f32,
    /// Consecutive qualifying samples needed to complete a phase.
    pub hold_samples: u32,
    /// Samples arriving this soon after a phase completes are ignored.
    pub transition_lockout: Duration,
    pub preview: PreviewOrientation,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            threshold_deg: 3.0,
            hold_samples: 3,
            transition_lockout: Duration::from_millis(700),
            preview: PreviewOrientation::Mirrored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CalibrationPhase {
    Left,
    Right,
    Done,
}

impl CalibrationPhase {
    fn direction(self) -> Option<VisualDirection> {
        match self {
            CalibrationPhase::Left => Some(VisualDirection::Left),
            CalibrationPhase::Right => Some(VisualDirection::Right),
            CalibrationPhase::Done => None,
        }
    }
}

/// Most extreme qualifying yaw reached per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct CalibrationExtremes {
    pub left: Option<f32>,
    pub right: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationEvent {
    /// Sample arrived during the transition lockout or after `Done`.
    Ignored,
    /// Qualifying sample; carries the current run length.
    Holding(u32),
    /// Non-qualifying sample; the run was reset to zero.
    Reset,
    /// A phase finished with the given extreme yaw.
    PhaseComplete {
        phase: CalibrationPhase,
        extreme: f32,
    },
    /// Right phase finished; calibration is over.
    Done(CalibrationExtremes),
}

#[derive(Debug, Clone)]
pub struct CalibrationMachine {
    config: CalibrationConfig,
    phase: CalibrationPhase,
    hold_count: u32,
    observed_extreme: Option<f32>,
    extremes: CalibrationExtremes,
    lockout_until: Option<Instant>,
}

impl CalibrationMachine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            phase: CalibrationPhase::Left,
            hold_count: 0,
            observed_extreme: None,
            extremes: CalibrationExtremes::default(),
            lockout_until: None,
        }
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn hold_count(&self) -> u32 {
        self.hold_count
    }

    pub fn observed_extreme(&self) -> Option<f32> {
        self.observed_extreme
    }

    pub fn extremes(&self) -> CalibrationExtremes {
        self.extremes
    }

    /// Feed one pose tick.
    pub fn observe(&mut self, sample: &PoseSample) -> CalibrationEvent {
        let Some(wanted) = self.phase.direction() else {
            return CalibrationEvent::Ignored;
        };
        if let Some(until) = self.lockout_until {
            if sample.timestamp < until {
                return CalibrationEvent::Ignored;
            }
            self.lockout_until = None;
        }

        let qualifies = sample.face_found
            && sample.yaw_deg.abs() >= self.config.threshold_deg
            && visual_direction(sample.yaw_deg, self.config.preview) == Some(wanted);

        if !qualifies {
            self.hold_count = 0;
            self.observed_extreme = None;
            return CalibrationEvent::Reset;
        }

        self.hold_count += 1;
        self.observed_extreme = Some(match self.observed_extreme {
            Some(prev) if prev.abs() >= sample.yaw_deg.abs() => prev,
            _ => sample.yaw_deg,
        });

        if self.hold_count < self.config.hold_samples {
            return CalibrationEvent::Holding(self.hold_count);
        }

        let extreme = self.observed_extreme.unwrap_or(sample.yaw_deg);
        let completed = self.phase;
        self.hold_count = 0;
        self.observed_extreme = None;

        match completed {
            CalibrationPhase::Left => {
                self.extremes.left = Some(extreme);
                self.phase = CalibrationPhase::Right;
                self.lockout_until = Some(sample.timestamp + self.config.transition_lockout);
                tracing::info!(extreme, "calibration: left turn confirmed");
                CalibrationEvent::PhaseComplete {
                    phase: completed,
                    extreme,
                }
            }
            CalibrationPhase::Right => {
                self.extremes.right = Some(extreme);
                self.phase = CalibrationPhase::Done;
                tracing::info!(
                    left = ?self.extremes.left,
                    right = extreme,
                    "calibration: right turn confirmed, calibration done"
                );
                CalibrationEvent::Done(self.extremes)
            }
            CalibrationPhase::Done => CalibrationEvent::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(at: Instant, yaw: f32) -> PoseSample {
        PoseSample {
            yaw_deg: yaw,
            pitch_delta: 0.0,
            timestamp: at,
            face_found: true,
        }
    }

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    // Mirrored preview: positive yaw is a visual left turn.
    const LEFT: f32 = 10.0;
    const RIGHT: f32 = -10.0;

    #[test]
    fn test_left_then_right_completes() {
        let t0 = Instant::now();
        let mut m = CalibrationMachine::new(CalibrationConfig::default());

        assert_eq!(m.observe(&sample(ms(t0, 0), LEFT)), CalibrationEvent::Holding(1));
        assert_eq!(m.observe(&sample(ms(t0, 300), 14.0)), CalibrationEvent::Holding(2));
        assert_eq!(
            m.observe(&sample(ms(t0, 600), 12.0)),
            CalibrationEvent::PhaseComplete {
                phase: CalibrationPhase::Left,
                extreme: 14.0
            }
        );
        assert_eq!(m.phase(), CalibrationPhase::Right);

        // Inside the 700 ms lockout
        assert_eq!(m.observe(&sample(ms(t0, 900), RIGHT)), CalibrationEvent::Ignored);
        assert_eq!(m.hold_count(), 0);

        assert_eq!(m.observe(&sample(ms(t0, 1300), RIGHT)), CalibrationEvent::Holding(1));
        assert_eq!(m.observe(&sample(ms(t0, 1600), -20.0)), CalibrationEvent::Holding(2));
        let ev = m.observe(&sample(ms(t0, 1900), RIGHT));
        assert_eq!(
            ev,
            CalibrationEvent::Done(CalibrationExtremes {
                left: Some(14.0),
                right: Some(-20.0)
            })
        );
        assert_eq!(m.phase(), CalibrationPhase::Done);
        assert_eq!(m.observe(&sample(ms(t0, 2200), LEFT)), CalibrationEvent::Ignored);
    }

    #[test]
    fn test_single_miss_resets_hold_count() {
        let t0 = Instant::now();
        let mut m = CalibrationMachine::new(CalibrationConfig::default());
        m.observe(&sample(ms(t0, 0), LEFT));
        m.observe(&sample(ms(t0, 300), LEFT));
        assert_eq!(m.hold_count(), 2);

        // Under threshold
        assert_eq!(m.observe(&sample(ms(t0, 600), 1.0)), CalibrationEvent::Reset);
        assert_eq!(m.hold_count(), 0);
        assert_eq!(m.observed_extreme(), None);

        m.observe(&sample(ms(t0, 900), LEFT));
        m.observe(&sample(ms(t0, 1200), LEFT));
        // Wrong direction
        assert_eq!(m.observe(&sample(ms(t0, 1500), RIGHT)), CalibrationEvent::Reset);
        assert_eq!(m.hold_count(), 0);

        m.observe(&sample(ms(t0, 1800), LEFT));
        // Lost face
        assert_eq!(m.observe(&PoseSample::no_face(ms(t0, 2100))), CalibrationEvent::Reset);
        assert_eq!(m.hold_count(), 0);
        assert_eq!(m.phase(), CalibrationPhase::Left);
    }

    #[test]
    fn test_raw_preview_flips_directions() {
        let t0 = Instant::now();
        let config = CalibrationConfig {
            preview: PreviewOrientation::Raw,
            ..CalibrationConfig::default()
        };
        let mut m = CalibrationMachine::new(config);
        // In a raw preview a visual left turn has negative yaw.
        assert_eq!(m.observe(&sample(ms(t0, 0), LEFT)), CalibrationEvent::Reset);
        assert_eq!(m.observe(&sample(ms(t0, 300), RIGHT)), CalibrationEvent::Holding(1));
    }

    #[test]
    fn test_hold_count_never_exceeds_target_without_completing() {
        let t0 = Instant::now();
        let mut m = CalibrationMachine::new(CalibrationConfig::default());
        for i in 0..20u64 {
            m.observe(&sample(ms(t0, i * 300), if i % 2 == 0 { LEFT } else { 0.5 }));
            assert!(m.hold_count() <= 1);
        }
        assert_eq!(m.phase(), CalibrationPhase::Left);
    }
}
