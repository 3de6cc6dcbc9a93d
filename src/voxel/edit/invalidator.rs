//! Dirty tracking for chunks whose data changed since the consumer last looked.

use std::collections::HashMap;

use crate::math::Aabb;
use crate::voxel::octree::NodeId;

/// Tracks which leaves need their derived data (meshes etc.) rebuilt.
///
/// Every mark also bumps a per-leaf generation counter, which consumers can
/// compare against a cached value to detect staleness without draining.
#[derive(Debug, Default)]
pub struct ChunkInvalidator {
    /// Leaves needing rebuild, with their bounds
    dirty: HashMap<NodeId, Aabb>,
    /// Generation counters for cache invalidation
    generations: HashMap<NodeId, u32>,
}

impl ChunkInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node dirty and increment its generation.
    pub fn mark_dirty(&mut self, id: NodeId, bounds: Aabb) {
        self.dirty.insert(id, bounds);
        let generation = self.generations.entry(id).or_insert(0);
        *generation = generation.wrapping_add(1);
    }

    /// Take the bounds of all dirty nodes in id order and clear the dirty set.
    pub fn take_dirty(&mut self) -> Vec<Aabb> {
        let mut dirty: Vec<(NodeId, Aabb)> = self.dirty.drain().collect();
        dirty.sort_by_key(|(id, _)| *id);
        dirty.into_iter().map(|(_, bounds)| bounds).collect()
    }

    /// Generation counter of a node; 0 if never marked.
    pub fn generation(&self, id: NodeId) -> u32 {
        self.generations.get(&id).copied().unwrap_or(0)
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn is_dirty(&self, id: NodeId) -> bool {
        self.dirty.contains_key(&id)
    }

    /// Get count of dirty nodes (for diagnostics).
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Clear all dirty state and reset generation counters.
    pub fn clear(&mut self) {
        self.dirty.clear();
        self.generations.clear();
    }
}
