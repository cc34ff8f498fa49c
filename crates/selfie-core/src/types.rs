use std::time::Instant;

/// A 2D landmark position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Index of the nose tip inside a 9-point nose cluster (68-point layout:
/// four bridge points followed by five base points, tip at the bridge end).
const NOSE_TIP_INDEX_68: usize = 3;
const NOSE_CLUSTER_LEN_68: usize = 9;

/// Eye and nose landmark clusters returned by a landmark detector.
///
/// `left_eye` is the eye cluster that appears on the left of the raw
/// (unmirrored) camera frame.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FaceLandmarks {
    pub left_eye: Vec<Point>,
    pub right_eye: Vec<Point>,
    pub nose: Vec<Point>,
}

impl FaceLandmarks {
    pub fn left_eye_center(&self) -> Option<Point> {
        centroid(&self.left_eye)
    }

    pub fn right_eye_center(&self) -> Option<Point> {
        centroid(&self.right_eye)
    }

    /// Nose tip: the bridge end for 68-point clusters, otherwise the cluster centroid.
    pub fn nose_tip(&self) -> Option<Point> {
        if self.nose.len() == NOSE_CLUSTER_LEN_68 {
            return Some(self.nose[NOSE_TIP_INDEX_68]);
        }
        centroid(&self.nose)
    }
}

fn centroid(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
    Some(Point::new(sx / n, sy / n))
}

/// One estimation tick worth of head pose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    /// Normalised left/right rotation in [-45, 45]. Positive means the subject
    /// turned toward their own left.
    pub yaw_deg: f32,
    /// Vertical nose displacement relative to the session baseline.
    /// Negative means the head tilted back (up).
    pub pitch_delta: f32,
    pub timestamp: Instant,
    pub face_found: bool,
}

impl PoseSample {
    pub fn no_face(timestamp: Instant) -> Self {
        Self {
            yaw_deg: 0.0,
            pitch_delta: 0.0,
            timestamp,
            face_found: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centroid_of_cluster() {
        let lm = FaceLandmarks {
            left_eye: vec![Point::new(0.0, 0.0), Point::new(2.0, 2.0)],
            right_eye: vec![],
            nose: vec![Point::new(5.0, 5.0)],
        };
        assert_eq!(lm.left_eye_center(), Some(Point::new(1.0, 1.0)));
        assert_eq!(lm.right_eye_center(), None);
        assert_eq!(lm.nose_tip(), Some(Point::new(5.0, 5.0)));
    }

    #[test]
    fn test_nose_tip_uses_68_point_layout() {
        let nose: Vec<Point> = (0..9).map(|i| Point::new(i as f32, i as f32 * 2.0)).collect();
        let lm = FaceLandmarks {
            left_eye: vec![],
            right_eye: vec![],
            nose,
        };
        assert_eq!(lm.nose_tip(), Some(Point::new(3.0, 6.0)));
    }

    #[test]
    fn test_distance() {
        assert!((Point::new(0.0, 0.0).distance(&Point::new(3.0, 4.0)) - 5.0).abs() < 1e-6);
    }
}
