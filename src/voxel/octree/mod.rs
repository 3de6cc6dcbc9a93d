//! Octree addressing and node tree.

pub mod id;
pub mod node;

pub use id::{NodeId, bounds_of, child_center, child_index_for, is_ancestor, local_to_world, world_to_local};
pub use node::Node;

/// Edge length of a level-0 chunk in voxels.
pub const CHUNK_SIZE: i32 = 16;

/// Number of voxels in one chunk.
pub const CHUNK_VOLUME: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Deepest supported root level. Ids of deeper trees would overflow `u64`.
pub const MAX_LEVEL: u8 = 19;
