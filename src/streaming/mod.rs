//! World archives and file persistence

pub mod disk_io;

pub use disk_io::{
    ARCHIVE_MAGIC, ARCHIVE_VERSION, ChunkSave, CustomSave, WorldSave,
    save_world, load_world, delete_world,
};
