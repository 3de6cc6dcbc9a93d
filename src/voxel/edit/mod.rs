//! Edit bookkeeping on top of the store.
//!
//! Undo/redo frames, network diffs, item overlays and dirty tracking for
//! consumers that cache derived data (meshes, collision).

pub mod delta;
pub mod overlay;
pub mod invalidator;
pub mod undo;

pub use delta::{DiffEntry, DiffRecorder, decode_packet, encode_packet};
pub use overlay::{AssetItem, DataItem, DisableEditsItem, Item, ItemHandle, ItemOverlay};
pub use invalidator::ChunkInvalidator;
pub use undo::{Frame, ModifiedVoxel, UndoRedoLog};
