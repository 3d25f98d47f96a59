//! Directed 2D line segments and epsilon-tolerant classification.
//!
//! Segments are directed: for counter-clockwise boundary loops the
//! polygon interior lies on the left of each edge.

use glam::Vec2;

use crate::constants::GEOM_EPSILON;

/// A directed segment from `start` to `end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSeg {
    pub start: Vec2,
    pub end: Vec2,
}

/// How a whole segment sits relative to a partition line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegRelation {
    /// Entirely on the left (interior) side, endpoints on the line allowed.
    Left,
    /// Entirely on the right (exterior) side, endpoints on the line allowed.
    Right,
    /// Collinear with the line within tolerance.
    Coincident,
    /// Crosses the line; `t` is the intersection parameter on the
    /// classified segment.
    Straddle { t: f32 },
}

impl LineSeg {
    pub fn new(start: Vec2, end: Vec2) -> Self {
        Self { start, end }
    }

    /// The same segment pointing the other way.
    #[inline]
    pub fn reversed(self) -> Self {
        Self {
            start: self.end,
            end: self.start,
        }
    }

    #[inline]
    pub fn direction(&self) -> Vec2 {
        self.end - self.start
    }

    #[inline]
    pub fn length_squared(&self) -> f32 {
        self.direction().length_squared()
    }

    /// Near-zero-length segments carry no usable direction and are
    /// dropped rather than classified.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.length_squared() <= GEOM_EPSILON * GEOM_EPSILON
    }

    /// Point at parameter `t` (0 = start, 1 = end).
    #[inline]
    pub fn point_at(&self, t: f32) -> Vec2 {
        self.start + self.direction() * t
    }

    /// Signed distance from `point` to this segment's infinite line.
    /// Positive on the left of the direction of travel.
    pub fn signed_distance(&self, point: Vec2) -> f32 {
        let direction = self.direction();
        let length = direction.length();
        if length <= f32::EPSILON {
            return 0.0;
        }
        direction.perp_dot(point - self.start) / length
    }

    /// Classify `seg` against this segment's infinite line.
    pub fn classify(&self, seg: &LineSeg) -> SegRelation {
        let d_start = self.signed_distance(seg.start);
        let d_end = self.signed_distance(seg.end);
        let on_start = d_start.abs() <= GEOM_EPSILON;
        let on_end = d_end.abs() <= GEOM_EPSILON;

        if on_start && on_end {
            SegRelation::Coincident
        } else if d_start >= -GEOM_EPSILON && d_end >= -GEOM_EPSILON {
            SegRelation::Left
        } else if d_start <= GEOM_EPSILON && d_end <= GEOM_EPSILON {
            SegRelation::Right
        } else {
            SegRelation::Straddle {
                t: d_start / (d_start - d_end),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(sx: f32, sy: f32, ex: f32, ey: f32) -> LineSeg {
        LineSeg::new(Vec2::new(sx, sy), Vec2::new(ex, ey))
    }

    #[test]
    fn test_signed_distance_left_is_positive() {
        let line = seg(0.0, 0.0, 2.0, 0.0);
        assert!(line.signed_distance(Vec2::new(1.0, 1.0)) > 0.0);
        assert!(line.signed_distance(Vec2::new(1.0, -1.0)) < 0.0);
        assert_eq!(line.signed_distance(Vec2::new(5.0, 0.0)), 0.0);
    }

    #[test]
    fn test_classify_sides() {
        let line = seg(0.0, 0.0, 2.0, 0.0);
        assert_eq!(line.classify(&seg(0.0, 1.0, 2.0, 2.0)), SegRelation::Left);
        assert_eq!(line.classify(&seg(0.0, -1.0, 2.0, -2.0)), SegRelation::Right);
        assert_eq!(line.classify(&seg(1.0, 0.0, 3.0, 0.0)), SegRelation::Coincident);
    }

    #[test]
    fn test_classify_touching_endpoint_is_not_straddling() {
        let line = seg(0.0, 0.0, 2.0, 0.0);
        // One endpoint on the line, the other above: still fully left.
        assert_eq!(line.classify(&seg(1.0, 0.0, 1.0, 3.0)), SegRelation::Left);
    }

    #[test]
    fn test_classify_straddle_splits_at_crossing() {
        let line = seg(0.0, 0.0, 2.0, 0.0);
        let crossing = seg(1.0, 1.0, 1.0, -1.0);
        match line.classify(&crossing) {
            SegRelation::Straddle { t } => {
                assert!((t - 0.5).abs() < 1e-6);
                assert_eq!(crossing.point_at(t), Vec2::new(1.0, 0.0));
            }
            other => panic!("expected straddle, got {:?}", other),
        }
    }

    #[test]
    fn test_degenerate_segment_detection() {
        assert!(seg(1.0, 1.0, 1.0, 1.0).is_degenerate());
        assert!(!seg(0.0, 0.0, 0.1, 0.0).is_degenerate());
    }

    #[test]
    fn test_reversed_swaps_endpoints() {
        let s = seg(0.0, 0.0, 1.0, 2.0);
        let r = s.reversed();
        assert_eq!(r.start, s.end);
        assert_eq!(r.end, s.start);
    }
}
