//! Voxel channel element types

use bytemuck::{Pod, Zeroable};
use rkyv::{Archive, Deserialize, Serialize};

/// Signed density sample. Positive is outside (empty), zero or negative is inside.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Pod, Zeroable, Archive, Deserialize, Serialize)]
pub struct VoxelValue(pub f32);

impl VoxelValue {
    /// Fully outside the surface
    pub const EMPTY: VoxelValue = VoxelValue(1.0);
    /// Fully inside the surface
    pub const FULL: VoxelValue = VoxelValue(-1.0);

    pub fn new(value: f32) -> Self {
        Self(value)
    }

    /// True if this sample lies outside the surface
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 > 0.0
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl From<f32> for VoxelValue {
    fn from(value: f32) -> Self {
        Self(value)
    }
}

/// Per-voxel material, 4 bytes RGBA.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable, Archive, Deserialize, Serialize)]
pub struct VoxelMaterial {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl VoxelMaterial {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Opaque color
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Pack to little-endian u32
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, self.a])
    }

    pub fn from_u32(packed: u32) -> Self {
        let [r, g, b, a] = packed.to_le_bytes();
        Self { r, g, b, a }
    }
}

/// The built-in channels. Custom channels are addressed by name instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Value,
    Material,
}

impl ChannelKind {
    pub fn name(self) -> &'static str {
        match self {
            ChannelKind::Value => "value",
            ChannelKind::Material => "material",
        }
    }
}

/// A single element of either built-in channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelValue {
    Value(VoxelValue),
    Material(VoxelMaterial),
}

impl ChannelValue {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelValue::Value(_) => ChannelKind::Value,
            ChannelValue::Material(_) => ChannelKind::Material,
        }
    }
}
