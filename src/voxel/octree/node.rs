//! Octree node.
//!
//! Children are created all eight at once, the first time a write needs to
//! reach below a node, and are only destroyed by dropping the whole tree.
//! Level-0 nodes own the chunk storage behind a `RwLock`.

use std::sync::{Arc, OnceLock, RwLock};

use glam::IVec3;

use crate::math::Aabb;
use crate::voxel::chunk::LeafData;
use crate::voxel::stats::MemoryStats;

use super::id::{NodeId, bounds_of, child_center, child_index_for, node_size};

/// A node of the voxel octree.
pub struct Node {
    center: IVec3,
    level: u8,
    id: NodeId,
    children: OnceLock<Box<[Node; 8]>>,
    data: Option<RwLock<LeafData>>,
}

impl Node {
    /// Root node at `depth`, centered on the origin.
    pub fn root(depth: u8, stats: &Arc<MemoryStats>) -> Self {
        Self::new(IVec3::ZERO, depth, NodeId::ROOT, stats)
    }

    fn new(center: IVec3, level: u8, id: NodeId, stats: &Arc<MemoryStats>) -> Self {
        Self {
            center,
            level,
            id,
            children: OnceLock::new(),
            data: (level == 0).then(|| RwLock::new(LeafData::new(Arc::clone(stats)))),
        }
    }

    pub fn center(&self) -> IVec3 {
        self.center
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Edge length in voxels.
    pub fn size(&self) -> i32 {
        node_size(self.level)
    }

    pub fn bounds(&self) -> Aabb {
        bounds_of(self.center, self.level)
    }

    /// True until the node is subdivided. Level-0 nodes are always leaves.
    pub fn is_leaf(&self) -> bool {
        self.children.get().is_none()
    }

    pub fn children(&self) -> Option<&[Node; 8]> {
        self.children.get().map(|c| &**c)
    }

    /// Chunk storage, present on level-0 nodes only.
    pub fn data(&self) -> Option<&RwLock<LeafData>> {
        self.data.as_ref()
    }

    /// Subdivide if needed and return the children.
    pub fn create_children(&self, stats: &Arc<MemoryStats>) -> &[Node; 8] {
        debug_assert!(self.level > 0, "level-0 nodes cannot be subdivided");
        self.children.get_or_init(|| {
            Box::new(std::array::from_fn(|i| {
                Node::new(
                    child_center(self.center, self.level, i),
                    self.level - 1,
                    self.id.child(self.level, i),
                    stats,
                )
            }))
        })
    }

    /// Existing child that contains `p`, if subdivided.
    pub fn child_containing(&self, p: IVec3) -> Option<&Node> {
        self.children().map(|c| &c[child_index_for(p, self.center)])
    }

    /// Deepest existing node containing `p`. Never creates nodes.
    pub fn leaf_at(&self, p: IVec3) -> &Node {
        debug_assert!(self.bounds().contains_point(p));
        let mut node = self;
        while let Some(child) = node.child_containing(p) {
            node = child;
        }
        node
    }

    /// Level-0 node containing `p`, subdividing on the way down.
    pub fn create_leaf_at(&self, p: IVec3, stats: &Arc<MemoryStats>) -> &Node {
        debug_assert!(self.bounds().contains_point(p));
        let mut node = self;
        while node.level > 0 {
            node = &node.create_children(stats)[child_index_for(p, node.center)];
        }
        node
    }

    /// Existing leaves (of any level) intersecting `bounds`.
    pub fn leaves_overlapping<'a>(&'a self, bounds: &Aabb, out: &mut Vec<&'a Node>) {
        if !self.bounds().intersects(bounds) {
            return;
        }
        match self.children() {
            None => out.push(self),
            Some(children) => {
                for child in children {
                    child.leaves_overlapping(bounds, out);
                }
            }
        }
    }

    /// Level-0 leaves intersecting `bounds`, subdividing as needed.
    pub fn create_leaves_overlapping<'a>(
        &'a self,
        bounds: &Aabb,
        stats: &Arc<MemoryStats>,
        out: &mut Vec<&'a Node>,
    ) {
        if !self.bounds().intersects(bounds) {
            return;
        }
        if self.level == 0 {
            out.push(self);
            return;
        }
        for child in self.create_children(stats) {
            child.create_leaves_overlapping(bounds, stats, out);
        }
    }

    /// Match ascending `ids` against the tree in a single traversal.
    ///
    /// The result holds, for each id in order, the existing leaf covering it:
    /// the level-0 node itself, or a coarser leaf that was never subdivided.
    /// Matching stops at the first id that is not a descendant of this node, so
    /// a result shorter than `ids` means the input was unsorted or malformed.
    pub fn leaves_with_ids(&self, ids: &[NodeId]) -> Vec<&Node> {
        let mut out = Vec::with_capacity(ids.len());
        let mut cursor = 0;
        self.match_ids(ids, &mut cursor, None, &mut out);
        out
    }

    /// Like [`Node::leaves_with_ids`], but subdivides down to level 0 so every
    /// returned node owns chunk storage.
    pub fn create_leaves_with_ids(&self, ids: &[NodeId], stats: &Arc<MemoryStats>) -> Vec<&Node> {
        let mut out = Vec::with_capacity(ids.len());
        let mut cursor = 0;
        self.match_ids(ids, &mut cursor, Some(stats), &mut out);
        out
    }

    fn match_ids<'a>(
        &'a self,
        ids: &[NodeId],
        cursor: &mut usize,
        create: Option<&Arc<MemoryStats>>,
        out: &mut Vec<&'a Node>,
    ) {
        while *cursor < ids.len() && self.id.is_ancestor_of(self.level, ids[*cursor]) {
            let children = match create {
                Some(stats) if self.level > 0 => Some(self.create_children(stats)),
                _ => self.children(),
            };
            match children {
                None => {
                    out.push(self);
                    *cursor += 1;
                }
                Some(children) => {
                    let before = *cursor;
                    for child in children {
                        child.match_ids(ids, cursor, create, out);
                    }
                    if *cursor == before {
                        // The id names this node itself or has a hole in its path.
                        return;
                    }
                }
            }
        }
    }

    /// Visit every existing leaf in ascending id order.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Node)) {
        match self.children() {
            None => f(self),
            Some(children) => {
                for child in children {
                    child.for_each_leaf(f);
                }
            }
        }
    }

    /// Number of level-0 nodes that exist.
    pub fn count_chunks(&self) -> usize {
        let mut count = 0;
        self.for_each_leaf(&mut |leaf| {
            if leaf.level == 0 {
                count += 1;
            }
        });
        count
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("center", &self.center)
            .field("subdivided", &!self.is_leaf())
            .finish()
    }
}
