//! Voxdata - sparse hierarchical voxel data store
//!
//! Chunked value/material/custom channels in an octree, region locks for
//! concurrent editing, undo/redo, network diffs, item overlays and compressed
//! world archives.

pub mod core;
pub mod math;
pub mod voxel;
pub mod streaming;
