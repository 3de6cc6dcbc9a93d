//! Error types for the voxel data store

use thiserror::Error;

/// Main error type for the store
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Malformed diff packet: {0}")]
    MalformedPacket(String),

    #[error("Unsupported archive version: {0}")]
    UnsupportedVersion(u32),

    #[error("Archive depth {found} does not match store depth {expected}")]
    DepthMismatch { expected: u8, found: u8 },

    #[error("Timed out acquiring {kind} lock '{label}' (held by '{holder}')")]
    LockTimeout {
        kind: &'static str,
        label: String,
        holder: String,
    },

    #[error("Current frame has unsaved edits; call save_frame before undo/redo")]
    UnsavedEdits,

    #[error("Item not found (already removed)")]
    ItemNotFound,

    #[error("Config error: {0}")]
    Config(String),
}
