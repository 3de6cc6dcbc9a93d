//! Node identifiers and position arithmetic.
//!
//! Every node id is a base-9 number: digit `L` is `child_index + 1` of the
//! level-`L` node on the path from the root, and zero for levels the path has
//! not reached yet. The root is 0. Sorting ids ascending yields a pre-order
//! traversal of the tree, which the save codec and diff replay rely on.

use glam::IVec3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::math::Aabb;

use super::{CHUNK_SIZE, MAX_LEVEL};

const fn build_pow9() -> [u64; MAX_LEVEL as usize + 2] {
    let mut table = [1u64; MAX_LEVEL as usize + 2];
    let mut i = 1;
    while i < table.len() {
        table[i] = table[i - 1] * 9;
        i += 1;
    }
    table
}

/// `9^L` for every level up to `MAX_LEVEL + 1`.
pub const POW9: [u64; MAX_LEVEL as usize + 2] = build_pow9();

/// `9^level`
#[inline]
pub fn pow9(level: u8) -> u64 {
    debug_assert!(level <= MAX_LEVEL + 1, "level {} out of range", level);
    POW9[level as usize]
}

/// Unique identifier of an octree node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Deserialize, Serialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Identifier of the root node.
    pub const ROOT: NodeId = NodeId(0);

    /// Id of child `child_index` (0..8) of a node at `parent_level`.
    #[inline]
    pub fn child(self, parent_level: u8, child_index: usize) -> NodeId {
        debug_assert!(parent_level >= 1 && parent_level <= MAX_LEVEL);
        debug_assert!(child_index < 8);
        NodeId(self.0 + (child_index as u64 + 1) * pow9(parent_level - 1))
    }

    /// True if the node `self` at `level` is `candidate` or one of its ancestors.
    #[inline]
    pub fn is_ancestor_of(self, level: u8, candidate: NodeId) -> bool {
        let p = pow9(level);
        candidate.0 / p == self.0 / p
    }

    /// Raw value
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Free-function form of [`NodeId::is_ancestor_of`].
#[inline]
pub fn is_ancestor(id: NodeId, level: u8, candidate: NodeId) -> bool {
    id.is_ancestor_of(level, candidate)
}

/// Edge length in voxels of a node at `level`.
#[inline]
pub fn node_size(level: u8) -> i32 {
    debug_assert!(level <= MAX_LEVEL);
    CHUNK_SIZE << level
}

/// Bounds of a node: `[center - size/2, center + size/2)`.
#[inline]
pub fn bounds_of(center: IVec3, level: u8) -> Aabb {
    Aabb::from_center_half_extent(center, node_size(level) / 2)
}

/// Octant of `position` relative to `center`: bit 0 X, bit 1 Y, bit 2 Z.
#[inline]
pub fn child_index_for(position: IVec3, center: IVec3) -> usize {
    (position.x >= center.x) as usize
        | ((position.y >= center.y) as usize) << 1
        | ((position.z >= center.z) as usize) << 2
}

/// Center of child `child_index` of a node at `parent_level`.
#[inline]
pub fn child_center(center: IVec3, parent_level: u8, child_index: usize) -> IVec3 {
    let quarter = node_size(parent_level) / 4;
    let offset = |bit: usize| if child_index & bit != 0 { quarter } else { -quarter };
    center + IVec3::new(offset(1), offset(2), offset(4))
}

/// Convert a world position to the root-relative local frame, where the
/// root spans `[0, size)` on every axis.
#[inline]
pub fn world_to_local(world: IVec3, depth: u8) -> IVec3 {
    world + IVec3::splat(node_size(depth) / 2)
}

/// Inverse of [`world_to_local`].
#[inline]
pub fn local_to_world(local: IVec3, depth: u8) -> IVec3 {
    local - IVec3::splat(node_size(depth) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow9_table() {
        assert_eq!(POW9[0], 1);
        assert_eq!(POW9[1], 9);
        assert_eq!(POW9[3], 729);
        assert_eq!(POW9[20], 9u64.pow(20));
    }

    #[test]
    fn test_child_ids_are_distinct_and_ordered() {
        let root = NodeId::ROOT;
        let ids: Vec<NodeId> = (0..8).map(|i| root.child(3, i)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(ids[0], NodeId(81));
        assert_eq!(ids[7], NodeId(8 * 81));
    }

    #[test]
    fn test_ancestry_uses_parent_level() {
        let depth = 4;
        let parent = NodeId::ROOT.child(depth, 5);
        let child = parent.child(depth - 1, 2);
        let grandchild = child.child(depth - 2, 7);

        assert!(parent.is_ancestor_of(depth - 1, child));
        assert!(parent.is_ancestor_of(depth - 1, grandchild));
        assert!(child.is_ancestor_of(depth - 2, grandchild));
        assert!(parent.is_ancestor_of(depth - 1, parent));

        let sibling = NodeId::ROOT.child(depth, 6);
        assert!(!sibling.is_ancestor_of(depth - 1, child));
        assert!(!child.is_ancestor_of(depth - 2, parent));
    }

    #[test]
    fn test_child_index_and_center() {
        let center = IVec3::ZERO;
        assert_eq!(child_index_for(IVec3::new(-1, -1, -1), center), 0);
        assert_eq!(child_index_for(IVec3::new(0, -1, -1), center), 1);
        assert_eq!(child_index_for(IVec3::new(-1, 0, -1), center), 2);
        assert_eq!(child_index_for(IVec3::new(0, 0, 0), center), 7);

        // Level 1 is 32 wide; children are 16 wide centered at +-8.
        assert_eq!(child_center(center, 1, 0), IVec3::splat(-8));
        assert_eq!(child_center(center, 1, 7), IVec3::splat(8));
        assert_eq!(child_center(center, 1, 1), IVec3::new(8, -8, -8));
    }

    #[test]
    fn test_child_bounds_tile_parent() {
        let center = IVec3::new(32, -32, 0);
        let level = 2;
        let parent = bounds_of(center, level);
        let volume: i64 = (0..8)
            .map(|i| {
                let child = bounds_of(child_center(center, level, i), level - 1);
                assert!(parent.contains(&child));
                child.volume()
            })
            .sum();
        assert_eq!(volume, parent.volume());
    }

    #[test]
    fn test_local_world_roundtrip() {
        let p = IVec3::new(-7, 3, 100);
        let local = world_to_local(p, 5);
        assert_eq!(local, p + IVec3::splat(256));
        assert_eq!(local_to_world(local, 5), p);
    }
}
