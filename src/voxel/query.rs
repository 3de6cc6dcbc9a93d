//! Sampling grids for bulk reads

use glam::IVec3;

use crate::math::Aabb;

/// A box sampled every `step = 1 << lod` voxels.
///
/// Samples are laid out x fastest, then y, then z:
/// `index = x + size.x * (y + size.y * z)` in sample units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryZone {
    bounds: Aabb,
    step: i32,
    size: IVec3,
}

fn ceil_div(a: i32, b: i32) -> i32 {
    (a + b - 1).div_euclid(b)
}

impl QueryZone {
    pub fn new(bounds: Aabb, lod: u8) -> Self {
        debug_assert!(lod < 31);
        let step = 1 << lod;
        let extent = bounds.size().max(IVec3::ZERO);
        let size = IVec3::new(ceil_div(extent.x, step), ceil_div(extent.y, step), ceil_div(extent.z, step));
        Self { bounds, step, size }
    }

    /// Every voxel of `bounds`.
    pub fn full(bounds: Aabb) -> Self {
        Self::new(bounds, 0)
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn step(&self) -> i32 {
        self.step
    }

    /// Number of samples along each axis.
    pub fn size(&self) -> IVec3 {
        self.size
    }

    /// Total number of samples; the required output buffer length.
    pub fn len(&self) -> usize {
        self.size.x.max(0) as usize * self.size.y.max(0) as usize * self.size.z.max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer index of sample position `p`.
    #[inline]
    pub fn index_of(&self, p: IVec3) -> usize {
        let s = (p - self.bounds.min) / self.step;
        debug_assert!(s.cmpge(IVec3::ZERO).all() && s.cmplt(self.size).all());
        (s.x + self.size.x * (s.y + self.size.y * s.z)) as usize
    }

    /// Sample positions in buffer order.
    pub fn positions(&self) -> impl Iterator<Item = IVec3> + '_ {
        let size = self.size;
        (0..size.z).flat_map(move |z| {
            (0..size.y).flat_map(move |y| {
                (0..size.x).map(move |x| self.bounds.min + IVec3::new(x, y, z) * self.step)
            })
        })
    }

    /// Samples of this zone that fall inside `other`, as a zone with the
    /// same step. `None` if no sample does.
    pub fn restrict(&self, other: &Aabb) -> Option<QueryZone> {
        let min = self.bounds.min;
        let lo = (other.min - min).max(IVec3::ZERO);
        let aligned = IVec3::new(
            ceil_div(lo.x, self.step),
            ceil_div(lo.y, self.step),
            ceil_div(lo.z, self.step),
        ) * self.step;
        let bounds = Aabb::new(min + aligned, self.bounds.max.min(other.max));
        if bounds.is_empty() {
            return None;
        }
        let step_lod = self.step.trailing_zeros() as u8;
        Some(QueryZone::new(bounds, step_lod))
    }
}
