//! Voxel data structures and operations

pub mod voxel;
pub mod octree;
pub mod chunk;
pub mod stats;
pub mod generator;
pub mod query;
pub mod lock;
pub mod data;
pub mod edit;

pub use voxel::{ChannelKind, ChannelValue, VoxelMaterial, VoxelValue};
pub use octree::{CHUNK_SIZE, CHUNK_VOLUME, MAX_LEVEL, Node, NodeId};
pub use chunk::{LeafData, VoxelChannel};
pub use stats::{MemoryKind, MemorySnapshot, MemoryStats};
pub use generator::{EmptyGenerator, EmptyState, FlatGenerator, NoiseGenerator, NoiseParams, WorldGenerator};
pub use query::QueryZone;
pub use lock::{LockHandle, LockKind, RegionLocks};
pub use data::{LeafAccelerator, VoxelData};
