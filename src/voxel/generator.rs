//! World generator contract and reference generators
//!
//! A generator supplies the value of every voxel that has never been edited.
//! It must be deterministic and callable from any thread.

use glam::IVec3;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::math::Aabb;

use super::voxel::{VoxelMaterial, VoxelValue};

/// Classification of a region by its value channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmptyState {
    /// Every value is outside the surface
    Empty,
    /// Every value is inside the surface
    Full,
    /// Unknown or a mix of both
    Mixed,
}

impl EmptyState {
    /// Combine the states of two disjoint regions
    pub fn combine(self, other: EmptyState) -> EmptyState {
        if self == other { self } else { EmptyState::Mixed }
    }
}

/// Supplies default voxel data for unedited space.
pub trait WorldGenerator: Send + Sync {
    /// Value and material at `p` sampled for level of detail `lod`.
    fn value_and_material(&self, p: IVec3, lod: u8) -> (VoxelValue, VoxelMaterial);

    fn value(&self, p: IVec3, lod: u8) -> VoxelValue {
        self.value_and_material(p, lod).0
    }

    fn material(&self, p: IVec3, lod: u8) -> VoxelMaterial {
        self.value_and_material(p, lod).1
    }

    /// Default of the named custom channel at `p`.
    fn custom(&self, _name: &str, _p: IVec3, _lod: u8) -> f32 {
        0.0
    }

    /// Classify `bounds` without sampling every voxel. Returning `Mixed` is
    /// always correct; `Empty`/`Full` must only be returned when exact.
    fn is_empty(&self, _bounds: &Aabb, _lod: u8) -> EmptyState {
        EmptyState::Mixed
    }
}

/// Nothing but air.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyGenerator;

impl WorldGenerator for EmptyGenerator {
    fn value_and_material(&self, _p: IVec3, _lod: u8) -> (VoxelValue, VoxelMaterial) {
        (VoxelValue::EMPTY, VoxelMaterial::default())
    }

    fn is_empty(&self, _bounds: &Aabb, _lod: u8) -> EmptyState {
        EmptyState::Empty
    }
}

/// Solid below a horizontal plane. Value is the signed distance `y - height`.
#[derive(Clone, Copy, Debug)]
pub struct FlatGenerator {
    pub height: i32,
    pub material: VoxelMaterial,
}

impl FlatGenerator {
    pub fn new(height: i32, material: VoxelMaterial) -> Self {
        Self { height, material }
    }
}

impl WorldGenerator for FlatGenerator {
    fn value_and_material(&self, p: IVec3, _lod: u8) -> (VoxelValue, VoxelMaterial) {
        (VoxelValue((p.y - self.height) as f32), self.material)
    }

    fn is_empty(&self, bounds: &Aabb, _lod: u8) -> EmptyState {
        if bounds.min.y > self.height {
            EmptyState::Empty
        } else if bounds.max.y - 1 <= self.height {
            EmptyState::Full
        } else {
            EmptyState::Mixed
        }
    }
}

/// Parameters for [`NoiseGenerator`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    pub seed: u32,
    pub scale: f32,        // Horizontal scale (larger = smoother)
    pub height_scale: f32, // Vertical scale (max height)
    pub octaves: u32,
    pub persistence: f32,
    pub lacunarity: f32,
    pub sea_level: f32, // Below this the surface material is sand
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            scale: 100.0,
            height_scale: 64.0,
            octaves: 4,
            persistence: 0.5,
            lacunarity: 2.0,
            sea_level: 16.0,
        }
    }
}

/// Heightfield terrain from fractal Brownian motion.
pub struct NoiseGenerator {
    params: NoiseParams,
    noise: Fbm<Perlin>,
}

const GRASS: VoxelMaterial = VoxelMaterial::rgb(76, 140, 52);
const SAND: VoxelMaterial = VoxelMaterial::rgb(194, 178, 128);

impl NoiseGenerator {
    pub fn new(params: NoiseParams) -> Self {
        let noise = Fbm::<Perlin>::new(params.seed)
            .set_octaves(params.octaves as usize)
            .set_persistence(params.persistence as f64)
            .set_lacunarity(params.lacunarity as f64);

        Self { params, noise }
    }

    pub fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// Surface height at column (x, z), in `[0, height_scale]`
    pub fn height_at(&self, x: i32, z: i32) -> f32 {
        let nx = (x as f32 / self.params.scale) as f64;
        let nz = (z as f32 / self.params.scale) as f64;
        let n = self.noise.get([nx, nz]).clamp(-1.0, 1.0);
        (((n + 1.0) / 2.0) * self.params.height_scale as f64) as f32
    }
}

impl WorldGenerator for NoiseGenerator {
    fn value_and_material(&self, p: IVec3, _lod: u8) -> (VoxelValue, VoxelMaterial) {
        let height = self.height_at(p.x, p.z);
        let material = if height < self.params.sea_level { SAND } else { GRASS };
        (VoxelValue(p.y as f32 - height), material)
    }

    fn is_empty(&self, bounds: &Aabb, _lod: u8) -> EmptyState {
        if bounds.min.y as f32 > self.params.height_scale {
            EmptyState::Empty
        } else if bounds.max.y <= 1 {
            EmptyState::Full
        } else {
            EmptyState::Mixed
        }
    }
}
