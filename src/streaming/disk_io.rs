//! World archives and disk I/O
//!
//! An archive stores every level-0 chunk that holds user data, in ascending id
//! order. Built-in channels are written only when dirty, together with the
//! mask of voxels the user edited; custom channels are always written.
//!
//! The payload is an rkyv archive of [`WorldSave`], compressed with LZ4. On
//! disk it follows a small header:
//!
//! ```text
//! magic "VXDA" | version u32 (little-endian) | LZ4 (size prepended) rkyv payload
//! ```

use std::io;
use std::path::Path;

use glam::IVec3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::voxel::chunk::{EDIT_MASK_WORDS, LeafData, VoxelChannel, fill_from_generator};
use crate::voxel::data::{VoxelData, read_leaf, write_leaf};
use crate::voxel::generator::WorldGenerator;
use crate::voxel::lock::LockKind;
use crate::voxel::octree::{CHUNK_VOLUME, NodeId};
use crate::voxel::voxel::{VoxelMaterial, VoxelValue};

/// Current archive version
pub const ARCHIVE_VERSION: u32 = 1;

/// First bytes of a compressed archive file
pub const ARCHIVE_MAGIC: [u8; 4] = *b"VXDA";

const HEADER_LEN: usize = ARCHIVE_MAGIC.len() + 4;

/// One saved custom channel.
#[derive(Clone, Debug, Default, PartialEq, Archive, Deserialize, Serialize)]
pub struct CustomSave {
    pub name: String,
    pub data: Vec<f32>,
}

/// Saved channels of one chunk.
///
/// Edit masks hold one bit per voxel, bit `i % 64` of word `i / 64`, and are
/// empty when the matching channel is absent.
#[derive(Clone, Debug, Default, PartialEq, Archive, Deserialize, Serialize)]
pub struct ChunkSave {
    pub id: NodeId,
    pub values: Option<Vec<VoxelValue>>,
    pub value_edits: Vec<u64>,
    pub materials: Option<Vec<VoxelMaterial>>,
    pub material_edits: Vec<u64>,
    /// Custom channels sorted by name
    pub custom: Vec<CustomSave>,
}

impl ChunkSave {
    fn is_empty(&self) -> bool {
        self.values.is_none() && self.materials.is_none() && self.custom.is_empty()
    }

    fn check(&self) -> Result<()> {
        let arrays = self
            .values
            .iter()
            .map(Vec::len)
            .chain(self.materials.iter().map(Vec::len))
            .chain(self.custom.iter().map(|c| c.data.len()));
        for len in arrays {
            if len != CHUNK_VOLUME {
                return Err(Error::CorruptArchive(format!("chunk {} has an array of {} elements", self.id, len)));
            }
        }
        let masks = [
            (self.values.is_some(), self.value_edits.len()),
            (self.materials.is_some(), self.material_edits.len()),
        ];
        for (present, len) in masks {
            let expected = if present { EDIT_MASK_WORDS } else { 0 };
            if len != expected {
                return Err(Error::CorruptArchive(format!("chunk {} has an edit mask of {} words", self.id, len)));
            }
        }
        Ok(())
    }
}

/// An in-memory world archive.
#[derive(Clone, Debug, PartialEq, Archive, Deserialize, Serialize)]
pub struct WorldSave {
    pub version: u32,
    pub world_id: u64,
    pub depth: u8,
    /// Chunks in ascending id order
    pub chunks: Vec<ChunkSave>,
}

impl WorldSave {
    pub fn new(world_id: u64, depth: u8) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            world_id,
            depth,
            chunks: Vec::new(),
        }
    }

    /// Serialize to the uncompressed rkyv payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self).map_err(|e| io::Error::other(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Validate and deserialize an uncompressed rkyv payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let archived = rkyv::access::<ArchivedWorldSave, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::CorruptArchive(e.to_string()))?;
        let save = rkyv::deserialize::<WorldSave, rkyv::rancor::Error>(archived)
            .map_err(|e| Error::CorruptArchive(e.to_string()))?;

        if save.version != ARCHIVE_VERSION {
            return Err(Error::UnsupportedVersion(save.version));
        }
        Ok(save)
    }

    /// Serialize and compress, with the archive header in front.
    pub fn compress(&self) -> Result<Vec<u8>> {
        let payload = self.to_bytes()?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() / 2);
        out.extend_from_slice(&ARCHIVE_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));
        Ok(out)
    }

    /// Inverse of [`WorldSave::compress`].
    pub fn decompress(data: &[u8]) -> Result<Self> {
        let rest = data
            .strip_prefix(&ARCHIVE_MAGIC)
            .ok_or_else(|| Error::CorruptArchive("bad magic".into()))?;
        let (version, payload) = rest
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::CorruptArchive("truncated header".into()))?;
        let version = u32::from_le_bytes(*version);
        if version != ARCHIVE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let decompressed = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::CorruptArchive(format!("LZ4 decompression failed: {}", e)))?;
        Self::from_bytes(&decompressed)
    }

    /// Total bytes of channel data held
    pub fn data_bytes(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| {
                let arrays = c.values.is_some() as usize + c.materials.is_some() as usize + c.custom.len();
                arrays * CHUNK_VOLUME * 4
            })
            .sum()
    }
}

/// Copy a loaded array and its edit mask over channel `T`. Without one, every
/// voxel of `T` stops being a user edit.
fn load_channel<T: VoxelChannel>(
    leaf: &mut LeafData,
    saved: Option<&[T]>,
    edits: &[u64],
    min: IVec3,
    generator: &dyn WorldGenerator,
) {
    match saved {
        Some(array) => {
            leaf.ensure_channel::<T>(|a| fill_from_generator(a, min, generator))
                .copy_from_slice(array);
            leaf.set_edit_mask::<T>(edits);
        }
        None => leaf.set_edit_mask::<T>(&[0; EDIT_MASK_WORDS]),
    }
}

fn saved_channel<T: VoxelChannel>(data: &LeafData) -> (Option<Vec<T>>, Vec<u64>) {
    match (data.channel::<T>(), data.edit_mask::<T>()) {
        (Some(array), Some(mask)) => (Some(array.to_vec()), mask.to_vec()),
        _ => (None, Vec::new()),
    }
}

impl VoxelData {
    /// Snapshot every chunk holding user data.
    pub fn save(&self) -> WorldSave {
        debug_assert!(
            self.locks().is_locked(LockKind::Read, &self.world_bounds()),
            "save without a lock on the whole world"
        );
        let mut save = WorldSave::new(self.config().world_id, self.depth());
        self.root().for_each_leaf(&mut |leaf| {
            if leaf.level() != 0 {
                return;
            }
            let Some(lock) = leaf.data() else {
                return;
            };
            let data = read_leaf(lock);
            let (values, value_edits) = saved_channel::<VoxelValue>(&data);
            let (materials, material_edits) = saved_channel::<VoxelMaterial>(&data);
            let chunk = ChunkSave {
                id: leaf.id(),
                values,
                value_edits,
                materials,
                material_edits,
                custom: data
                    .custom_channels()
                    .into_iter()
                    .map(|(name, array)| CustomSave {
                        name: name.to_string(),
                        data: array.to_vec(),
                    })
                    .collect(),
            };
            if !chunk.is_empty() {
                save.chunks.push(chunk);
            }
        });
        log::info!("Saved {} chunks ({} bytes of channel data)", save.chunks.len(), save.data_bytes());
        save
    }

    /// Load an archive over the current tree. Returns the bounds of every
    /// loaded chunk.
    ///
    /// The archive is checked completely before anything is written. Voxels
    /// the archive does not mark as edited are derived again from the
    /// generator and the current items.
    pub fn load(&self, save: &WorldSave) -> Result<Vec<Aabb>> {
        debug_assert!(
            self.locks().is_locked(LockKind::ReadWrite, &self.world_bounds()),
            "load without a read-write lock on the whole world"
        );
        if save.version != ARCHIVE_VERSION {
            return Err(Error::UnsupportedVersion(save.version));
        }
        if save.depth != self.depth() {
            return Err(Error::DepthMismatch {
                expected: self.depth(),
                found: save.depth,
            });
        }
        if let Some(pair) = save.chunks.windows(2).find(|w| w[0].id >= w[1].id) {
            return Err(Error::CorruptArchive(format!("chunk {} is out of order after {}", pair[1].id, pair[0].id)));
        }
        for chunk in &save.chunks {
            chunk.check()?;
        }
        if save.world_id != self.config().world_id {
            log::warn!("Loading archive of world {} into world {}", save.world_id, self.config().world_id);
        }

        let ids: Vec<NodeId> = save.chunks.iter().map(|c| c.id).collect();
        let leaves = self.root().create_leaves_with_ids(&ids, self.stats_sink());
        if leaves.len() != ids.len() {
            let bad = ids.get(leaves.len()).copied().unwrap_or_default();
            return Err(Error::CorruptArchive(format!("{} is not a chunk of this world", bad)));
        }

        let generator = &**self.generator();
        for (leaf, chunk) in leaves.iter().zip(&save.chunks) {
            let Some(lock) = leaf.data() else {
                continue;
            };
            let min = leaf.bounds().min;

            let mut data = write_leaf(lock);
            load_channel(&mut data, chunk.values.as_deref(), &chunk.value_edits, min, generator);
            load_channel(&mut data, chunk.materials.as_deref(), &chunk.material_edits, min, generator);
            for custom in &chunk.custom {
                data.ensure_custom_channel(&custom.name, |_| {}).copy_from_slice(&custom.data);
            }
        }
        self.refold_leaves(&leaves);

        log::info!("Loaded {} chunks from world {}", leaves.len(), save.world_id);
        Ok(leaves.iter().map(|leaf| leaf.bounds()).collect())
    }
}

/// Save an archive to disk (compressed)
pub async fn save_world(path: &Path, save: &WorldSave) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let compressed = save.compress()?;
    tokio::fs::write(path, compressed).await?;
    Ok(())
}

/// Load an archive from disk (if it exists)
pub async fn load_world(path: &Path) -> Result<Option<WorldSave>> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let compressed = tokio::fs::read(path).await?;
    Ok(Some(WorldSave::decompress(&compressed)?))
}

/// Delete an archive from disk
pub async fn delete_world(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await? {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::config::DataConfig;
    use crate::voxel::edit::overlay::AssetItem;
    use crate::voxel::generator::{EmptyGenerator, FlatGenerator};

    fn store(depth: u8) -> VoxelData {
        VoxelData::new(DataConfig::with_depth(depth), Arc::new(EmptyGenerator)).unwrap()
    }

    fn edited_store() -> VoxelData {
        let data = store(3);
        let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "test").unwrap();
        data.set::<VoxelValue>(Aabb::new(IVec3::new(-2, 0, 0), IVec3::new(2, 1, 1)), |p, v| {
            *v = VoxelValue(p.x as f32)
        });
        data.set::<VoxelMaterial>(Aabb::from_point(IVec3::new(40, 40, 40)), |_, m| {
            *m = VoxelMaterial::rgb(1, 2, 3)
        });
        data.set_custom("heat", Aabb::from_point(IVec3::new(40, 40, 40)), |_, v| *v = 7.5);
        data.unlock(lock);
        data
    }

    fn snapshot(data: &VoxelData) -> WorldSave {
        let lock = data.lock(LockKind::Read, data.world_bounds(), "save").unwrap();
        let save = data.save();
        data.unlock(lock);
        save
    }

    #[test]
    fn test_save_only_dirty_channels() {
        let data = edited_store();
        let save = snapshot(&data);

        assert_eq!(save.chunks.len(), 3);
        assert!(save.chunks.windows(2).all(|w| w[0].id < w[1].id));
        let material_chunk = save.chunks.iter().find(|c| c.materials.is_some()).unwrap();
        assert!(material_chunk.values.is_none());
        assert_eq!(material_chunk.custom.len(), 1);
        assert_eq!(material_chunk.custom[0].name, "heat");
        // One material voxel was edited.
        let edited: u32 = material_chunk.material_edits.iter().map(|w| w.count_ones()).sum();
        assert_eq!(edited, 1);
        assert!(material_chunk.value_edits.is_empty());
    }

    #[test]
    fn test_item_data_is_not_saved() {
        let data = store(3);
        let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "test").unwrap();
        let generator = Arc::new(FlatGenerator::new(0, VoxelMaterial::rgb(5, 5, 5)));
        data.add_item(AssetItem::new(Aabb::new(IVec3::ZERO, IVec3::splat(16)), generator));
        assert!(data.save().chunks.is_empty());
        data.unlock(lock);
    }

    #[test]
    fn test_roundtrip_between_stores() {
        let source = edited_store();
        let bytes = snapshot(&source).compress().unwrap();

        let target = store(3);
        let lock = target.lock(LockKind::ReadWrite, target.world_bounds(), "load").unwrap();
        let bounds = target.load(&WorldSave::decompress(&bytes).unwrap()).unwrap();
        assert_eq!(bounds.len(), 3);

        assert_eq!(target.get_value(IVec3::new(-2, 0, 0), 0), VoxelValue(-2.0));
        assert_eq!(target.get_value(IVec3::new(1, 0, 0), 0), VoxelValue(1.0));
        assert_eq!(target.get_value(IVec3::new(1, 5, 0), 0), VoxelValue::EMPTY);
        assert_eq!(target.get_material(IVec3::new(40, 40, 40), 0), VoxelMaterial::rgb(1, 2, 3));

        let zone = crate::voxel::query::QueryZone::full(Aabb::from_point(IVec3::new(40, 40, 40)));
        let mut heat = [0.0];
        target.get_custom("heat", &zone, 0, &mut heat);
        assert_eq!(heat[0], 7.5);
        target.unlock(lock);

        // A save of the loaded store reproduces the archive.
        assert_eq!(snapshot(&target), snapshot(&source));
    }

    #[test]
    fn test_load_drops_edits_missing_from_archive() {
        let data = store(3);
        let save = snapshot(&data);
        let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "test").unwrap();
        data.set::<VoxelValue>(Aabb::from_point(IVec3::ZERO), |_, v| *v = VoxelValue::FULL);

        let mut archive = save.clone();
        let id = data.root().leaf_at(IVec3::ZERO).id();
        archive.chunks.push(ChunkSave {
            id,
            materials: Some(vec![VoxelMaterial::rgb(9, 9, 9); CHUNK_VOLUME]),
            material_edits: vec![u64::MAX; EDIT_MASK_WORDS],
            ..Default::default()
        });
        data.load(&archive).unwrap();
        assert_eq!(data.get_value(IVec3::ZERO, 0), VoxelValue::EMPTY);
        assert_eq!(data.get_material(IVec3::ZERO, 0), VoxelMaterial::rgb(9, 9, 9));
        data.unlock(lock);
    }

    #[test]
    fn test_corruption_is_detected() {
        let bytes = snapshot(&edited_store()).compress().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(WorldSave::decompress(&bad_magic), Err(Error::CorruptArchive(_))));

        assert!(matches!(WorldSave::decompress(&bytes[..6]), Err(Error::CorruptArchive(_))));
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(WorldSave::decompress(truncated), Err(Error::CorruptArchive(_))));

        assert!(matches!(WorldSave::from_bytes(&[0; 3]), Err(Error::CorruptArchive(_))));
        assert!(matches!(WorldSave::from_bytes(&[0xFF; 64]), Err(Error::CorruptArchive(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = WorldSave::new(1, 3).compress().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(WorldSave::decompress(&bytes), Err(Error::UnsupportedVersion(7))));

        let mut future = WorldSave::new(1, 3);
        future.version = 7;
        let payload = future.to_bytes().unwrap();
        assert!(matches!(WorldSave::from_bytes(&payload), Err(Error::UnsupportedVersion(7))));
    }

    #[test]
    fn test_load_rederives_unedited_voxels_from_items() {
        let source = store(3);
        let lock = source.lock(LockKind::ReadWrite, source.world_bounds(), "test").unwrap();
        source.set::<VoxelValue>(Aabb::from_point(IVec3::ONE), |_, v| *v = VoxelValue(-9.0));
        source.unlock(lock);
        let save = snapshot(&source);

        let target = store(3);
        let lock = target.lock(LockKind::ReadWrite, target.world_bounds(), "test").unwrap();
        let block = Aabb::new(IVec3::splat(-8), IVec3::splat(8));
        target.add_item(AssetItem::new(block, Arc::new(FlatGenerator::new(5, VoxelMaterial::rgb(5, 5, 5)))));
        target.load(&save).unwrap();

        assert_eq!(target.get_value(IVec3::ONE, 0), VoxelValue(-9.0));
        assert_eq!(target.get_value(IVec3::new(2, 3, 2), 0), VoxelValue(-2.0));
        target.unlock(lock);
    }

    #[test]
    fn test_load_rejects_bad_edit_masks() {
        let data = store(3);
        let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "test").unwrap();
        let mut archive = WorldSave::new(0, 3);
        archive.chunks.push(ChunkSave {
            id: data.root().leaf_at(IVec3::ZERO).id(),
            values: Some(vec![VoxelValue::FULL; CHUNK_VOLUME]),
            value_edits: vec![u64::MAX; 3],
            ..Default::default()
        });
        assert!(matches!(data.load(&archive), Err(Error::CorruptArchive(_))));
        assert_eq!(data.num_chunks(), 0);
        data.unlock(lock);
    }

    #[test]
    fn test_load_rejects_bad_archives() {
        let data = store(3);
        let lock = data.lock(LockKind::ReadWrite, data.world_bounds(), "test").unwrap();

        let deeper = WorldSave::new(0, 4);
        assert!(matches!(
            data.load(&deeper),
            Err(Error::DepthMismatch { expected: 3, found: 4 })
        ));

        let mut unordered = snapshot(&edited_store());
        unordered.chunks.reverse();
        assert!(matches!(data.load(&unordered), Err(Error::CorruptArchive(_))));

        let mut short = WorldSave::new(0, 3);
        short.chunks.push(ChunkSave {
            id: data.root().leaf_at(IVec3::ZERO).id(),
            values: Some(vec![VoxelValue::FULL; 10]),
            ..Default::default()
        });
        assert!(matches!(data.load(&short), Err(Error::CorruptArchive(_))));
        assert_eq!(data.num_chunks(), 0);
        data.unlock(lock);
    }

    #[tokio::test]
    async fn test_save_and_load_world() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saves/world.vxd");
        assert!(load_world(&path).await.unwrap().is_none());

        let save = snapshot(&edited_store());
        save_world(&path, &save).await.unwrap();
        let loaded = load_world(&path).await.unwrap().unwrap();
        assert_eq!(loaded, save);

        delete_world(&path).await.unwrap();
        assert!(load_world(&path).await.unwrap().is_none());
    }
}
