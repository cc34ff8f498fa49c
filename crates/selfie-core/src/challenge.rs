//! Liveness challenges.
//!
//! The supported challenge is a dual-phase nod: the head must tilt back
//! (pitch delta below `-nod_threshold`) and forward (above `+nod_threshold`),
//! in either order. Each phase is a one-shot flag, not an oscillation count.
//! A single debounce window is shared by both flags so one abrupt motion
//! cannot satisfy both in the same instant.
//!
//! The machine is clock-agnostic. The capture controller drives the
//! countdown (`countdown_tick`, once per second), the completion animation
//! (`progress_tick`, every 100 ms) and the pauses between challenges
//! (`advance`, `mark_verified`).
//!
//! Lifecycle per challenge:
//!
//! ```text
//! countdown 3-2-1 -> armed -> (up + down) -> animating -> completed
//!                       ^                                    |
//!                       +------------ advance ---------------+
//! ```

use std::time::{Duration, Instant};

/// Kinds of liveness challenge. A session runs them in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChallengeKind {
    /// Tilt the head back, then forward (or the reverse).
    Nod,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChallengeConfig {
    pub challenges: Vec<ChallengeKind>,
    /// Pitch delta magnitude a nod phase must exceed.
    pub nod_threshold: f32,
    /// Minimum spacing between two accepted flag events (any flag).
    pub debounce: Duration,
    /// Countdown ticks (one per second) before sampling starts.
    pub countdown_ticks: u8,
    /// Length of the completion animation.
    pub progress_duration: Duration,
    /// Animation timer period.
    pub progress_tick: Duration,
    /// Pause between a completed challenge and the next one.
    pub advance_pause: Duration,
    /// Pause between the last completed challenge and verification.
    pub verify_pause: Duration,
    /// An armed challenge with no accepted flag for this long is abandoned.
    pub stall_timeout: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            challenges: vec![ChallengeKind::Nod],
            nod_threshold: 5.0,
            debounce: Duration::from_millis(300),
            countdown_ticks: 3,
            progress_duration: Duration::from_millis(550),
            progress_tick: Duration::from_millis(100),
            advance_pause: Duration::from_millis(300),
            verify_pause: Duration::from_millis(300),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-challenge nod flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PhaseFlags {
    pub up_validated: bool,
    pub down_validated: bool,
}

impl PhaseFlags {
    pub fn both(&self) -> bool {
        self.up_validated && self.down_validated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeEvent {
    /// Not armed (countdown, animation, or finished). Sample discarded.
    Ignored,
    NoChange,
    UpValidated,
    DownValidated,
    /// Both flags set; detection frozen and the completion animation starts.
    Satisfied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// No animation running.
    Idle,
    Advanced(u8),
    /// Animation finished and the challenge is marked completed.
    Completed { index: usize, last: bool },
}

#[derive(Debug, Clone)]
pub struct ChallengeMachine {
    config: ChallengeConfig,
    index: usize,
    progress: f32,
    completed: Vec<bool>,
    verified: bool,
    flags: PhaseFlags,
    last_event_at: Option<Instant>,
    last_progress_at: Option<Instant>,
    countdown: u8,
    armed: bool,
    animating: bool,
}

impl ChallengeMachine {
    pub fn new(config: ChallengeConfig) -> Self {
        let count = config.challenges.len();
        let countdown = config.countdown_ticks;
        Self {
            config,
            index: 0,
            progress: 0.0,
            completed: vec![false; count],
            verified: false,
            flags: PhaseFlags::default(),
            last_event_at: None,
            last_progress_at: None,
            countdown,
            armed: false,
            animating: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Option<ChallengeKind> {
        self.config.challenges.get(self.index).copied()
    }

    pub fn progress(&self) -> u8 {
        self.progress.clamp(0.0, 100.0) as u8
    }

    pub fn completed_flags(&self) -> &[bool] {
        &self.completed
    }

    pub fn flags(&self) -> PhaseFlags {
        self.flags
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn is_animating(&self) -> bool {
        self.animating
    }

    pub fn countdown_remaining(&self) -> u8 {
        self.countdown
    }

    /// One countdown second elapsed. Returns the remaining count; reaching
    /// zero arms detection.
    pub fn countdown_tick(&mut self, now: Instant) -> u8 {
        if self.countdown == 0 {
            return 0;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.arm(now);
        }
        self.countdown
    }

    fn arm(&mut self, now: Instant) {
        if self.current().is_none() {
            return;
        }
        self.armed = true;
        self.last_progress_at = Some(now);
        tracing::debug!(index = self.index, "challenge armed");
    }

    /// Feed one pose tick.
    pub fn observe(&mut self, sample: &crate::types::PoseSample) -> ChallengeEvent {
        if !self.armed {
            return ChallengeEvent::Ignored;
        }
        if !sample.face_found {
            return ChallengeEvent::NoChange;
        }
        match self.current() {
            Some(ChallengeKind::Nod) => self.observe_nod(sample.pitch_delta, sample.timestamp),
            None => ChallengeEvent::Ignored,
        }
    }

    fn observe_nod(&mut self, pitch_delta: f32, at: Instant) -> ChallengeEvent {
        let debounced = match self.last_event_at {
            Some(last) => at.saturating_duration_since(last) >= self.config.debounce,
            None => true,
        };
        if !debounced {
            return ChallengeEvent::NoChange;
        }

        let threshold = self.config.nod_threshold;
        let event = if pitch_delta < -threshold && !self.flags.up_validated {
            self.flags.up_validated = true;
            ChallengeEvent::UpValidated
        } else if pitch_delta > threshold && !self.flags.down_validated {
            self.flags.down_validated = true;
            ChallengeEvent::DownValidated
        } else {
            return ChallengeEvent::NoChange;
        };

        self.last_event_at = Some(at);
        self.last_progress_at = Some(at);
        tracing::debug!(index = self.index, ?event, pitch_delta, "nod phase accepted");

        if self.flags.both() {
            self.armed = false;
            self.animating = true;
            self.progress = 0.0;
            return ChallengeEvent::Satisfied;
        }
        event
    }

    /// Advance the completion animation by one timer period.
    pub fn progress_tick(&mut self) -> ProgressEvent {
        if !self.animating {
            return ProgressEvent::Idle;
        }
        let duration = self.config.progress_duration.as_secs_f32().max(f32::EPSILON);
        self.progress += 100.0 * self.config.progress_tick.as_secs_f32() / duration;
        if self.progress < 100.0 {
            return ProgressEvent::Advanced(self.progress());
        }

        self.progress = 100.0;
        self.animating = false;
        self.completed[self.index] = true;
        let last = self.index + 1 >= self.config.challenges.len();
        tracing::info!(index = self.index, last, "challenge completed");
        ProgressEvent::Completed {
            index: self.index,
            last,
        }
    }

    /// Move to the next challenge after a completed one. Returns `false` when
    /// there is none.
    pub fn advance(&mut self, now: Instant) -> bool {
        if self.animating || !self.completed.get(self.index).copied().unwrap_or(false) {
            return false;
        }
        if self.index + 1 >= self.config.challenges.len() {
            return false;
        }
        self.index += 1;
        self.flags = PhaseFlags::default();
        self.last_event_at = None;
        self.progress = 0.0;
        self.arm(now);
        true
    }

    /// Set `verified` once every challenge has completed.
    pub fn mark_verified(&mut self) -> bool {
        if !self.completed.is_empty() && self.completed.iter().all(|c| *c) {
            self.verified = true;
        }
        self.verified
    }

    /// Armed with no accepted flag event for `stall_timeout`.
    pub fn is_stalled(&self, now: Instant) -> bool {
        match (self.armed, self.last_progress_at) {
            (true, Some(since)) => now.saturating_duration_since(since) >= self.config.stall_timeout,
            _ => false,
        }
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoseSample;

    fn pitch(at: Instant, delta: f32) -> PoseSample {
        PoseSample {
            yaw_deg: 0.0,
            pitch_delta: delta,
            timestamp: at,
            face_found: true,
        }
    }

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    fn armed_machine(t0: Instant) -> ChallengeMachine {
        let mut m = ChallengeMachine::new(ChallengeConfig::default());
        assert_eq!(m.countdown_remaining(), 3);
        assert_eq!(m.countdown_tick(t0), 2);
        assert_eq!(m.countdown_tick(t0), 1);
        assert!(!m.is_armed());
        assert_eq!(m.countdown_tick(t0), 0);
        assert!(m.is_armed());
        m
    }

    fn finish_animation(m: &mut ChallengeMachine) -> ProgressEvent {
        loop {
            match m.progress_tick() {
                ProgressEvent::Advanced(_) => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_countdown_ignores_samples() {
        let t0 = Instant::now();
        let mut m = ChallengeMachine::new(ChallengeConfig::default());
        assert_eq!(m.observe(&pitch(t0, -20.0)), ChallengeEvent::Ignored);
        m.countdown_tick(t0);
        assert_eq!(m.observe(&pitch(t0, 20.0)), ChallengeEvent::Ignored);
        assert_eq!(m.flags(), PhaseFlags::default());
    }

    #[test]
    fn test_up_then_down_verifies() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        assert_eq!(m.observe(&pitch(ms(t0, 0), -6.0)), ChallengeEvent::UpValidated);
        assert_eq!(m.observe(&pitch(ms(t0, 400), 6.0)), ChallengeEvent::Satisfied);
        assert!(!m.is_armed());
        assert!(m.is_animating());
        assert!(!m.is_verified());

        assert_eq!(
            finish_animation(&mut m),
            ProgressEvent::Completed { index: 0, last: true }
        );
        assert_eq!(m.progress(), 100);
        assert_eq!(m.completed_flags(), &[true]);
        assert!(m.mark_verified());
    }

    #[test]
    fn test_down_then_up_verifies() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        assert_eq!(m.observe(&pitch(ms(t0, 0), 8.0)), ChallengeEvent::DownValidated);
        assert_eq!(m.observe(&pitch(ms(t0, 300), -8.0)), ChallengeEvent::Satisfied);
    }

    #[test]
    fn test_shared_debounce_rejects_second_flag_within_window() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        assert_eq!(m.observe(&pitch(ms(t0, 0), -10.0)), ChallengeEvent::UpValidated);
        assert_eq!(m.observe(&pitch(ms(t0, 100), 10.0)), ChallengeEvent::NoChange);
        assert!(!m.flags().down_validated);
        assert_eq!(m.observe(&pitch(ms(t0, 299), 10.0)), ChallengeEvent::NoChange);
        assert!(!m.flags().down_validated);
        assert_eq!(m.observe(&pitch(ms(t0, 300), 10.0)), ChallengeEvent::Satisfied);
    }

    #[test]
    fn test_single_flag_never_verifies() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        for i in 0..50u64 {
            m.observe(&pitch(ms(t0, i * 300), -12.0));
        }
        assert!(m.flags().up_validated);
        assert!(!m.flags().down_validated);
        assert_eq!(m.progress_tick(), ProgressEvent::Idle);
        assert!(!m.mark_verified());
        assert!(!m.is_verified());
    }

    #[test]
    fn test_threshold_is_strict() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        assert_eq!(m.observe(&pitch(ms(t0, 0), -5.0)), ChallengeEvent::NoChange);
        assert_eq!(m.observe(&pitch(ms(t0, 300), 5.0)), ChallengeEvent::NoChange);
        assert_eq!(m.observe(&PoseSample::no_face(ms(t0, 600))), ChallengeEvent::NoChange);
    }

    #[test]
    fn test_samples_discarded_during_animation() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        m.observe(&pitch(ms(t0, 0), -10.0));
        m.observe(&pitch(ms(t0, 300), 10.0));
        assert!(m.is_animating());
        assert_eq!(m.observe(&pitch(ms(t0, 900), -10.0)), ChallengeEvent::Ignored);
        assert_eq!(m.progress_tick(), ProgressEvent::Advanced(18));
    }

    #[test]
    fn test_animation_takes_six_ticks() {
        let t0 = Instant::now();
        let mut m = armed_machine(t0);
        m.observe(&pitch(ms(t0, 0), -10.0));
        m.observe(&pitch(ms(t0, 300), 10.0));
        let mut ticks = 0;
        loop {
            ticks += 1;
            if let ProgressEvent::Completed { .. } = m.progress_tick() {
                break;
            }
        }
        assert_eq!(ticks, 6);
    }

    #[test]
    fn test_multiple_challenges_advance_in_order() {
        let t0 = Instant::now();
        let config = ChallengeConfig {
            challenges: vec![ChallengeKind::Nod, ChallengeKind::Nod],
            ..ChallengeConfig::default()
        };
        let mut m = ChallengeMachine::new(config);
        for _ in 0..3 {
            m.countdown_tick(t0);
        }
        m.observe(&pitch(ms(t0, 0), -10.0));
        m.observe(&pitch(ms(t0, 300), 10.0));
        assert_eq!(
            finish_animation(&mut m),
            ProgressEvent::Completed { index: 0, last: false }
        );
        assert!(!m.mark_verified());

        assert!(m.advance(ms(t0, 1200)));
        assert_eq!(m.index(), 1);
        assert!(m.is_armed());
        assert_eq!(m.flags(), PhaseFlags::default());

        // Debounce state does not leak across challenges
        assert_eq!(m.observe(&pitch(ms(t0, 1200), 10.0)), ChallengeEvent::DownValidated);
        assert_eq!(m.observe(&pitch(ms(t0, 1500), -10.0)), ChallengeEvent::Satisfied);
        assert_eq!(
            finish_animation(&mut m),
            ProgressEvent::Completed { index: 1, last: true }
        );
        assert!(!m.advance(ms(t0, 2500)));
        assert!(m.mark_verified());
    }

    #[test]
    fn test_stall_detection() {
        let t0 = Instant::now();
        let mut m = ChallengeMachine::new(ChallengeConfig::default());
        assert!(!m.is_stalled(ms(t0, 60_000)));
        for _ in 0..3 {
            m.countdown_tick(t0);
        }
        assert!(!m.is_stalled(ms(t0, 29_999)));
        assert!(m.is_stalled(ms(t0, 30_000)));

        m.observe(&pitch(ms(t0, 20_000), -10.0));
        assert!(!m.is_stalled(ms(t0, 30_000)));
        assert!(m.is_stalled(ms(t0, 50_000)));
    }
}
