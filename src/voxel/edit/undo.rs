//! Undo/redo history.
//!
//! Every change made through [`VoxelData::set`] is recorded into the current
//! frame as `(leaf id, index, old, new)`. A voxel changed several times in one
//! frame keeps its first old value and its latest new value.
//! [`VoxelData::save_frame`] closes the frame and pushes it on the undo stack.

use std::collections::HashMap;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::voxel::data::{VoxelData, guard, write_leaf};
use crate::voxel::lock::LockKind;
use crate::voxel::octree::NodeId;
use crate::voxel::voxel::{ChannelKind, ChannelValue};

/// One changed voxel of a built-in channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModifiedVoxel {
    /// Level-0 leaf holding the voxel
    pub id: NodeId,
    /// Index inside the leaf's chunk arrays
    pub index: u32,
    pub old: ChannelValue,
    pub new: ChannelValue,
    /// Whether the voxel was user-edited before the change
    pub old_edited: bool,
}

impl ModifiedVoxel {
    fn key(&self) -> (NodeId, u32, ChannelKind) {
        (self.id, self.index, self.new.kind())
    }
}

/// A saved group of changes.
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u64,
    /// What the caller said caused the frame
    pub cause: Aabb,
    pub diffs: Vec<ModifiedVoxel>,
}

/// Undo and redo stacks plus the frame being recorded.
#[derive(Debug, Default)]
pub struct UndoRedoLog {
    current: Vec<ModifiedVoxel>,
    current_index: HashMap<(NodeId, u32, ChannelKind), usize>,
    undo_stack: Vec<Frame>,
    redo_stack: Vec<Frame>,
    next_frame_id: u64,
    history_position: i64,
}

impl UndoRedoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge changes into the current frame.
    pub fn record(&mut self, edits: Vec<ModifiedVoxel>) {
        for edit in edits {
            match self.current_index.get(&edit.key()) {
                Some(&i) => self.current[i].new = edit.new,
                None => {
                    self.current_index.insert(edit.key(), self.current.len());
                    self.current.push(edit);
                }
            }
        }
    }

    pub fn is_current_frame_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Close the current frame. Returns its id, or `None` if nothing changed
    /// since the last save (no frame is pushed and the redo stack is kept).
    pub fn save_frame(&mut self, cause: Aabb) -> Option<u64> {
        if self.current.is_empty() {
            return None;
        }
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.current_index.clear();
        self.undo_stack.push(Frame {
            id,
            cause,
            diffs: std::mem::take(&mut self.current),
        });
        self.redo_stack.clear();
        self.history_position += 1;
        Some(id)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Number of saved frames minus number of undone ones, relative to the
    /// start of history.
    pub fn history_position(&self) -> i64 {
        self.history_position
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    /// Drop all history, including the unsaved frame.
    pub fn clear_frames(&mut self) {
        self.current.clear();
        self.current_index.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.history_position = 0;
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

impl VoxelData {
    /// Close the current frame of changes. No-op when undo/redo is disabled.
    pub fn save_frame(&self, cause: Aabb) -> Option<u64> {
        if !self.config().enable_undo_redo {
            return None;
        }
        let id = guard(&self.undo).save_frame(cause);
        if let Some(id) = id {
            log::debug!("Saved undo frame {} ({})", id, cause);
        }
        id
    }

    /// Revert the last saved frame. Returns the bounds of the leaves touched.
    /// The caller holds a read-write lock on the whole world.
    ///
    /// Fails with [`Error::UnsavedEdits`] if changes were made since the last
    /// [`VoxelData::save_frame`]; nothing is modified in that case.
    pub fn undo(&self) -> Result<Vec<Aabb>> {
        self.step_history(Direction::Undo)
    }

    /// Re-apply the last undone frame.
    pub fn redo(&self) -> Result<Vec<Aabb>> {
        self.step_history(Direction::Redo)
    }

    pub fn is_current_frame_empty(&self) -> bool {
        guard(&self.undo).is_current_frame_empty()
    }

    pub fn clear_frames(&self) {
        guard(&self.undo).clear_frames();
    }

    pub fn history_position(&self) -> i64 {
        guard(&self.undo).history_position()
    }

    pub fn can_undo(&self) -> bool {
        guard(&self.undo).can_undo()
    }

    pub fn can_redo(&self) -> bool {
        guard(&self.undo).can_redo()
    }

    fn step_history(&self, direction: Direction) -> Result<Vec<Aabb>> {
        if !self.config().enable_undo_redo {
            return Ok(Vec::new());
        }
        debug_assert!(
            self.locks().is_locked(LockKind::ReadWrite, &self.world_bounds()),
            "undo/redo needs a read-write lock on the whole world"
        );

        let frame = {
            let mut history = guard(&self.undo);
            if !history.is_current_frame_empty() {
                log::warn!("Undo/redo requested with unsaved edits; call save_frame first");
                return Err(Error::UnsavedEdits);
            }
            let popped = match direction {
                Direction::Undo => history.undo_stack.pop(),
                Direction::Redo => history.redo_stack.pop(),
            };
            match popped {
                Some(frame) => frame,
                None => return Ok(Vec::new()),
            }
        };

        let use_old = matches!(direction, Direction::Undo);
        let bounds = self.apply_frame(&frame.diffs, use_old);
        if self.config().enable_multiplayer {
            self.record_network_diffs(&frame.diffs, use_old);
        }

        let mut history = guard(&self.undo);
        match direction {
            Direction::Undo => {
                history.history_position -= 1;
                history.redo_stack.push(frame);
            }
            Direction::Redo => {
                history.history_position += 1;
                history.undo_stack.push(frame);
            }
        }
        Ok(bounds)
    }

    /// Write the old (or new) side of `diffs` back into the tree.
    fn apply_frame(&self, diffs: &[ModifiedVoxel], use_old: bool) -> Vec<Aabb> {
        let mut order: Vec<&ModifiedVoxel> = diffs.iter().collect();
        order.sort_by_key(|d| d.id);
        let ids: Vec<NodeId> = order.iter().map(|d| d.id).collect();
        let leaves = self.root().create_leaves_with_ids(&ids, self.stats_sink());
        debug_assert_eq!(leaves.len(), ids.len(), "frame names unknown leaves");

        let generator = &**self.generator();
        let mut bounds = Vec::new();
        let mut offset = 0;
        for group in order.chunk_by(|a, b| a.id == b.id) {
            let Some(leaf) = leaves.get(offset) else {
                break;
            };
            offset += group.len();
            let Some(lock) = leaf.data() else {
                continue;
            };
            let leaf_bounds = leaf.bounds();

            let mut data = write_leaf(lock);
            for diff in group {
                let (value, edited) = if use_old { (diff.old, diff.old_edited) } else { (diff.new, true) };
                data.write_value(diff.index as usize, value, edited, leaf_bounds.min, generator);
            }
            drop(data);
            self.mark_dirty(leaf.id(), leaf_bounds);
            bounds.push(leaf_bounds);
        }
        bounds
    }
}
