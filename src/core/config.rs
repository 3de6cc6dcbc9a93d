//! Store configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::voxel::octree::MAX_LEVEL;

/// Default network packet budget in bytes.
pub const DEFAULT_PACKET_BUDGET: usize = 2048;

/// Configuration for a [`VoxelData`](crate::voxel::VoxelData) store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Level of the root node. World size = 16 << depth voxels per side.
    pub depth: u8,
    /// Record per-voxel diffs for undo/redo.
    pub enable_undo_redo: bool,
    /// Record per-voxel diffs for network replication.
    pub enable_multiplayer: bool,
    /// Maximum size of a diff packet in bytes.
    pub packet_budget_bytes: usize,
    /// Unique id written into save archives.
    pub world_id: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            enable_undo_redo: false,
            enable_multiplayer: false,
            packet_budget_bytes: DEFAULT_PACKET_BUDGET,
            world_id: 0,
        }
    }
}

impl DataConfig {
    /// Config with the given depth and everything else default.
    pub fn with_depth(depth: u8) -> Self {
        Self {
            depth,
            ..Default::default()
        }
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 || self.depth > MAX_LEVEL {
            return Err(Error::Config(format!(
                "depth must be in 1..={}, got {}",
                MAX_LEVEL, self.depth
            )));
        }
        if self.packet_budget_bytes == 0 {
            return Err(Error::Config("packet_budget_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DataConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_depth() {
        assert!(DataConfig::with_depth(0).validate().is_err());
        assert!(DataConfig::with_depth(MAX_LEVEL + 1).validate().is_err());
        assert!(DataConfig::with_depth(MAX_LEVEL).validate().is_ok());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/data.json");

        let config = DataConfig {
            depth: 5,
            enable_undo_redo: true,
            enable_multiplayer: true,
            packet_budget_bytes: 1024,
            world_id: 42,
        };
        config.save_sync(&path).unwrap();

        let loaded = DataConfig::load_sync(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: DataConfig = serde_json::from_str(r#"{ "depth": 3 }"#).unwrap();
        assert_eq!(config.depth, 3);
        assert_eq!(config.packet_budget_bytes, DEFAULT_PACKET_BUDGET);
        assert!(!config.enable_undo_redo);
    }
}
