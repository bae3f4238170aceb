//! Math type re-exports and grid-specific math utilities.
//!
//! This module re-exports the double precision types from `glam` used for
//! world-space grid coordinates, and provides the bounding box type shared
//! by shapes and blends.

pub use glam::{DVec3, IVec3, UVec3};

use std::fmt;

/// 3D bounding box with double precision.
#[derive(Clone, Copy, PartialEq)]
pub struct BBox3d {
    pub min: DVec3,
    pub max: DVec3,
}

impl BBox3d {
    /// Empty bounding box (inverted, will expand on first point).
    pub const EMPTY: Self = Self {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    /// Create a new bounding box from min and max points.
    #[inline]
    pub const fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Box of the given extent centered on `center`.
    #[inline]
    pub fn from_center_size(center: DVec3, size: DVec3) -> Self {
        let half = size * 0.5;
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Check if this box is empty (has no volume).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Expand this box to include another box.
    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    /// Smallest box containing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        out.expand_by_box(other);
        out
    }

    /// Whether `other` lies inside this box, allowing `tolerance` slack.
    pub fn contains_box(&self, other: &Self, tolerance: f64) -> bool {
        (self.min - other.min).cmple(DVec3::splat(tolerance)).all()
            && (other.max - self.max).cmple(DVec3::splat(tolerance)).all()
    }

    /// Get the center of the box.
    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size (extents) of the box.
    #[inline]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }
}

impl Default for BBox3d {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for BBox3d {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BBox3d({:?} - {:?})", self.min, self.max)
    }
}

/// Clamp into `[0, 1]`.
///
/// Ratios computed at exact cell boundaries can land a hair outside the
/// unit interval, so every interpolation weight goes through here.
#[inline]
pub fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox3d() {
        let mut b = BBox3d::EMPTY;
        assert!(b.is_empty());

        b.expand_by_box(&BBox3d::new(DVec3::splat(-1.0), DVec3::splat(1.0)));
        assert_eq!(b.center(), DVec3::ZERO);
        assert_eq!(b.size(), DVec3::splat(2.0));
    }

    #[test]
    fn test_union_and_contains() {
        let a = BBox3d::new(DVec3::ZERO, DVec3::ONE);
        let b = BBox3d::new(DVec3::splat(0.5), DVec3::splat(2.0));
        let u = a.union(&b);
        assert_eq!(u.min, DVec3::ZERO);
        assert_eq!(u.max, DVec3::splat(2.0));
        assert!(u.contains_box(&a, 0.0));
        assert!(u.contains_box(&b, 0.0));
        assert!(!a.contains_box(&b, 1e-9));
    }

    #[test]
    fn test_from_center_size() {
        let b = BBox3d::from_center_size(DVec3::new(1.0, 2.0, 3.0), DVec3::splat(4.0));
        assert_eq!(b.min, DVec3::new(-1.0, 0.0, 1.0));
        assert_eq!(b.max, DVec3::new(3.0, 4.0, 5.0));
    }

    #[test]
    fn test_clamp01() {
        assert_eq!(clamp01(-1e-12), 0.0);
        assert_eq!(clamp01(1.0 + 1e-12), 1.0);
        assert_eq!(clamp01(0.25), 0.25);
    }

    #[test]
    fn test_bbox_pod() {
        assert_eq!(std::mem::size_of::<BBox3d>(), 48);
    }
}
