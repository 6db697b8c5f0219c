//! Landmark geometry: eye aspect ratio, centroids and head tilt.
//!
//! All functions are total. Degenerate geometry maps to fixed fallback
//! values instead of errors so a single odd frame never interrupts a scan.

use crate::types::{EyeContour, Point};

/// Lower clamp for the eye aspect ratio.
pub const EAR_MIN: f32 = 0.1;
/// Upper clamp for the eye aspect ratio.
pub const EAR_MAX: f32 = 0.45;
/// Returned when the eye corners coincide (zero horizontal distance).
pub const DEGENERATE_EAR: f32 = 0.35;

pub fn euclidean_distance(a: Point, b: Point) -> f32 {
    (b.x - a.x).hypot(b.y - a.y)
}

/// Eye aspect ratio `(|p2-p6| + |p3-p5|) / (2 * |p1-p4|)`, clamped to
/// `[EAR_MIN, EAR_MAX]`.
///
/// An open eye sits around 0.3; a closed eye drops toward the lower clamp.
pub fn eye_aspect_ratio(eye: &EyeContour) -> f32 {
    let vertical_a = euclidean_distance(eye[1], eye[5]);
    let vertical_b = euclidean_distance(eye[2], eye[4]);
    let horizontal = euclidean_distance(eye[0], eye[3]);

    if horizontal == 0.0 {
        return DEGENERATE_EAR;
    }

    let ear = (vertical_a + vertical_b) / (2.0 * horizontal);
    if ear.is_nan() {
        return DEGENERATE_EAR;
    }
    ear.clamp(EAR_MIN, EAR_MAX)
}

/// Mean of the given points. An empty slice yields the origin.
pub fn centroid(points: &[Point]) -> Point {
    if points.is_empty() {
        return Point::default();
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point::new(sx / n, sy / n)
}

/// Roll of the head as `sin(atan2(dy, dx))` of the line joining both eye
/// centroids. Negative when the right eye sits higher than the left.
pub fn head_tilt(left: &EyeContour, right: &EyeContour) -> f32 {
    let l = centroid(left);
    let r = centroid(right);
    (r.y - l.y).atan2(r.x - l.x).sin()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Eye contour centred at (cx, cy) with the given width and lid opening.
    /// EAR of the result is `2 * open / width`.
    fn eye(cx: f32, cy: f32, width: f32, open: f32) -> EyeContour {
        let hw = width / 2.0;
        let qw = width / 4.0;
        [
            Point::new(cx - hw, cy),
            Point::new(cx - qw, cy - open),
            Point::new(cx + qw, cy - open),
            Point::new(cx + hw, cy),
            Point::new(cx + qw, cy + open),
            Point::new(cx - qw, cy + open),
        ]
    }

    #[test]
    fn test_distance() {
        let d = euclidean_distance(Point::new(0.0, 0.0), Point::new(3.0, 4.0));
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_ear_open_eye() {
        let ear = eye_aspect_ratio(&eye(50.0, 50.0, 30.0, 5.0));
        assert!((ear - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_ear_clamps_low() {
        // Fully closed lids: both vertical distances are zero
        let ear = eye_aspect_ratio(&eye(50.0, 50.0, 30.0, 0.0));
        assert_eq!(ear, EAR_MIN);
    }

    #[test]
    fn test_ear_clamps_high() {
        let ear = eye_aspect_ratio(&eye(50.0, 50.0, 10.0, 20.0));
        assert_eq!(ear, EAR_MAX);
    }

    #[test]
    fn test_ear_degenerate_corners() {
        let mut contour = eye(50.0, 50.0, 30.0, 5.0);
        contour[3] = contour[0];
        assert_eq!(eye_aspect_ratio(&contour), DEGENERATE_EAR);
    }

    #[test]
    fn test_ear_always_in_range() {
        // Deterministic sweep over widths and openings, including odd shapes
        for w in [0.5f32, 1.0, 7.0, 30.0, 300.0] {
            for o in [0.0f32, 0.01, 1.0, 4.0, 50.0, 1000.0] {
                let ear = eye_aspect_ratio(&eye(-12.0, 400.0, w, o));
                assert!((EAR_MIN..=EAR_MAX).contains(&ear), "w={w} o={o} ear={ear}");
            }
        }
    }

    #[test]
    fn test_centroid() {
        let c = centroid(&eye(10.0, -4.0, 8.0, 2.0));
        assert!((c.x - 10.0).abs() < 1e-5);
        assert!((c.y + 4.0).abs() < 1e-5);
        assert_eq!(centroid(&[]), Point::default());
    }

    #[test]
    fn test_head_tilt_level() {
        let tilt = head_tilt(&eye(100.0, 100.0, 30.0, 5.0), &eye(160.0, 100.0, 30.0, 5.0));
        assert!(tilt.abs() < 1e-6);
    }

    #[test]
    fn test_head_tilt_sign() {
        // Right eye higher on screen (smaller y) gives a negative tilt
        let up = head_tilt(&eye(100.0, 100.0, 30.0, 5.0), &eye(160.0, 80.0, 30.0, 5.0));
        assert!(up < -0.1);
        let down = head_tilt(&eye(100.0, 100.0, 30.0, 5.0), &eye(160.0, 120.0, 30.0, 5.0));
        assert!(down > 0.1);
        assert!((up + down).abs() < 1e-5);
    }
}
