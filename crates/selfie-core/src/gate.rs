/// Requires an unbroken run of positive face detections before the session
/// may leave the camera stage. A single miss resets the run.
#[derive(Debug, Clone)]
pub struct FaceGate {
    required: u32,
    streak: u32,
}

impl FaceGate {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            streak: 0,
        }
    }

    /// Record one detection tick. Returns `true` once the run is long enough.
    pub fn observe(&mut self, face_found: bool) -> bool {
        if face_found {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.is_open()
    }

    pub fn is_open(&self) -> bool {
        self.streak >= self.required
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_required_run() {
        let mut gate = FaceGate::new(6);
        for _ in 0..5 {
            assert!(!gate.observe(true));
        }
        assert!(gate.observe(true));
    }

    #[test]
    fn test_single_miss_resets() {
        let mut gate = FaceGate::new(6);
        for _ in 0..5 {
            gate.observe(true);
        }
        assert!(!gate.observe(false));
        assert_eq!(gate.streak(), 0);
        for _ in 0..5 {
            assert!(!gate.observe(true));
        }
        assert!(gate.observe(true));
    }
}
