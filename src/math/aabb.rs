//! Integer axis-aligned bounding box

use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Axis-aligned box of voxel positions, min inclusive and max exclusive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aabb {
    pub min: IVec3,
    pub max: IVec3,
}

impl Aabb {
    /// Create AABB from min (inclusive) and max (exclusive) corners
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Box containing a single voxel
    pub fn from_point(p: IVec3) -> Self {
        Self { min: p, max: p + IVec3::ONE }
    }

    /// Create AABB from center and half-extent
    pub fn from_center_half_extent(center: IVec3, half_extent: i32) -> Self {
        Self {
            min: center - IVec3::splat(half_extent),
            max: center + IVec3::splat(half_extent),
        }
    }

    /// Get size (max - min)
    pub fn size(&self) -> IVec3 {
        self.max - self.min
    }

    /// Number of voxels inside, zero if degenerate
    pub fn volume(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        let s = self.size();
        s.x as i64 * s.y as i64 * s.z as i64
    }

    /// True if the box contains no voxel
    pub fn is_empty(&self) -> bool {
        self.max.x <= self.min.x || self.max.y <= self.min.y || self.max.z <= self.min.z
    }

    /// Check if point is inside AABB
    pub fn contains_point(&self, p: IVec3) -> bool {
        p.x >= self.min.x && p.x < self.max.x &&
        p.y >= self.min.y && p.y < self.max.y &&
        p.z >= self.min.z && p.z < self.max.z
    }

    /// Check if `other` is fully inside this box
    pub fn contains(&self, other: &Aabb) -> bool {
        other.min.x >= self.min.x && other.max.x <= self.max.x &&
        other.min.y >= self.min.y && other.max.y <= self.max.y &&
        other.min.z >= self.min.z && other.max.z <= self.max.z
    }

    /// Check if two AABBs share at least one voxel
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x < other.max.x && self.max.x > other.min.x &&
        self.min.y < other.max.y && self.max.y > other.min.y &&
        self.min.z < other.max.z && self.max.z > other.min.z
    }

    /// Intersection of both boxes (may be empty)
    pub fn overlap(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// True if both corners are multiples of `step`
    pub fn is_multiple_of(&self, step: i32) -> bool {
        let m = |v: i32| v.rem_euclid(step) == 0;
        m(self.min.x) && m(self.min.y) && m(self.min.z) &&
        m(self.max.x) && m(self.max.y) && m(self.max.z)
    }

    /// Parts of `self` not covered by `other`, as at most 6 disjoint boxes
    pub fn subtract(&self, other: &Aabb) -> Vec<Aabb> {
        if !self.intersects(other) {
            return vec![*self];
        }
        let mut out = Vec::with_capacity(6);
        let mut rest = *self;

        for axis in 0..3 {
            if rest.min[axis] < other.min[axis] {
                let mut slab = rest;
                slab.max[axis] = other.min[axis];
                out.push(slab);
                rest.min[axis] = other.min[axis];
            }
            if rest.max[axis] > other.max[axis] {
                let mut slab = rest;
                slab.min[axis] = other.max[axis];
                out.push(slab);
                rest.max[axis] = other.max[axis];
            }
        }
        out
    }
}

impl std::fmt::Display for Aabb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {})..({}, {}, {})",
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(min: i32, max: i32) -> Aabb {
        Aabb::new(IVec3::splat(min), IVec3::splat(max))
    }

    #[test]
    fn test_new_and_accessors() {
        let aabb = cube(0, 4);
        assert_eq!(aabb.size(), IVec3::splat(4));
        assert_eq!(aabb.volume(), 64);
        assert!(!aabb.is_empty());
        assert!(cube(2, 2).is_empty());
    }

    #[test]
    fn test_contains_point_max_exclusive() {
        let aabb = cube(0, 16);
        assert!(aabb.contains_point(IVec3::ZERO));
        assert!(aabb.contains_point(IVec3::splat(15)));
        assert!(!aabb.contains_point(IVec3::new(16, 0, 0)));
        assert!(!aabb.contains_point(IVec3::new(-1, 0, 0)));
    }

    #[test]
    fn test_intersects_touching_is_disjoint() {
        let a = cube(0, 16);
        let b = Aabb::new(IVec3::new(16, 0, 0), IVec3::new(32, 16, 16));
        let c = cube(8, 24);
        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert_eq!(a.overlap(&c), cube(8, 16));
    }

    #[test]
    fn test_subtract_covers_remainder() {
        let a = cube(0, 10);
        let b = cube(3, 6);
        let parts = a.subtract(&b);
        let total: i64 = parts.iter().map(Aabb::volume).sum();
        assert_eq!(total, a.volume() - b.volume());
        for part in &parts {
            assert!(!part.intersects(&b));
            assert!(a.contains(part));
        }

        assert!(b.subtract(&a).is_empty());
        assert_eq!(a.subtract(&cube(20, 30)), vec![a]);
    }

    #[test]
    fn test_is_multiple_of() {
        assert!(cube(-8, 8).is_multiple_of(4));
        assert!(!Aabb::new(IVec3::new(1, 0, 0), IVec3::splat(8)).is_multiple_of(2));
    }
}
