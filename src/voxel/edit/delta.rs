//! Network diffs.
//!
//! With multiplayer enabled every changed voxel is pushed onto a per-channel
//! recorder as `(leaf id, index, new value)`. The host drains the recorders
//! into size-bounded packets; replicas apply them with
//! [`VoxelData::apply_value_diffs`] / [`VoxelData::apply_material_diffs`].

use std::collections::VecDeque;

use bytemuck::Pod;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::voxel::chunk::VoxelChannel;
use crate::voxel::data::{VoxelData, guard, write_leaf};
use crate::voxel::octree::{CHUNK_VOLUME, NodeId};
use crate::voxel::voxel::{VoxelMaterial, VoxelValue};

/// Bytes of an entry besides the value: leaf id (8) and index (4).
pub const ENTRY_HEADER_BYTES: usize = 12;

/// Bytes of the packet header: entry count.
pub const PACKET_HEADER_BYTES: usize = 4;

/// One replicated voxel change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiffEntry<T> {
    pub id: NodeId,
    pub index: u32,
    pub value: T,
}

impl<T> DiffEntry<T> {
    pub fn new(id: NodeId, index: u32, value: T) -> Self {
        Self { id, index, value }
    }
}

/// Serialized size of one entry carrying a `T`.
pub fn entry_bytes<T>() -> usize {
    ENTRY_HEADER_BYTES + std::mem::size_of::<T>()
}

/// Entries that fit in one packet; at least one.
pub fn packet_capacity(max_packet_bytes: usize, per_entry_bytes: usize) -> usize {
    (max_packet_bytes / per_entry_bytes.max(1)).max(1)
}

/// Packets needed to send `total` entries.
pub fn packet_count(total: usize, max_packet_bytes: usize, per_entry_bytes: usize) -> usize {
    total.div_ceil(packet_capacity(max_packet_bytes, per_entry_bytes))
}

/// Accumulates diffs, newest last.
#[derive(Debug)]
pub struct DiffRecorder<T> {
    entries: Vec<DiffEntry<T>>,
}

impl<T> Default for DiffRecorder<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: Copy> DiffRecorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DiffEntry<T>) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DiffEntry<T>] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drain everything into packets of at most `max_packet_bytes`.
    ///
    /// Entries are popped newest first and each packet is filled back to
    /// front, then prepended to the result, so the packets come out oldest
    /// first and each is internally in recording order. Only the oldest
    /// packet can be partial.
    pub fn take_packets(&mut self, max_packet_bytes: usize, per_entry_bytes: usize) -> Vec<Vec<DiffEntry<T>>> {
        let capacity = packet_capacity(max_packet_bytes, per_entry_bytes);
        let count = packet_count(self.entries.len(), max_packet_bytes, per_entry_bytes);

        let mut packets = VecDeque::with_capacity(count);
        for _ in 0..count {
            let len = capacity.min(self.entries.len());
            let mut packet = VecDeque::with_capacity(len);
            for _ in 0..len {
                if let Some(entry) = self.entries.pop() {
                    packet.push_front(entry);
                }
            }
            packets.push_front(Vec::from(packet));
        }
        packets.into()
    }
}

/// Little-endian wire form: `count: u32`, then per entry `id: u64`,
/// `index: u32` and the raw value bytes.
pub fn encode_packet<T: Pod>(packet: &[DiffEntry<T>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PACKET_HEADER_BYTES + packet.len() * entry_bytes::<T>());
    out.extend_from_slice(&(packet.len() as u32).to_le_bytes());
    for entry in packet {
        out.extend_from_slice(&entry.id.0.to_le_bytes());
        out.extend_from_slice(&entry.index.to_le_bytes());
        out.extend_from_slice(bytemuck::bytes_of(&entry.value));
    }
    out
}

/// Inverse of [`encode_packet`].
pub fn decode_packet<T: Pod>(bytes: &[u8]) -> Result<Vec<DiffEntry<T>>> {
    let header: [u8; 4] = bytes
        .get(..PACKET_HEADER_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::MalformedPacket("missing header".into()))?;
    let count = u32::from_le_bytes(header) as usize;
    let per_entry = entry_bytes::<T>();
    let expected = count
        .checked_mul(per_entry)
        .and_then(|body| body.checked_add(PACKET_HEADER_BYTES))
        .ok_or_else(|| Error::MalformedPacket("entry count overflows".into()))?;
    if bytes.len() != expected {
        return Err(Error::MalformedPacket(format!(
            "expected {} bytes for {} entries, got {}",
            expected,
            count,
            bytes.len()
        )));
    }

    let body = &bytes[PACKET_HEADER_BYTES..];
    let entries = body
        .chunks_exact(per_entry)
        .map(|raw| {
            let mut id = [0u8; 8];
            id.copy_from_slice(&raw[0..8]);
            let mut index = [0u8; 4];
            index.copy_from_slice(&raw[8..12]);
            DiffEntry {
                id: NodeId(u64::from_le_bytes(id)),
                index: u32::from_le_bytes(index),
                value: bytemuck::pod_read_unaligned(&raw[ENTRY_HEADER_BYTES..]),
            }
        })
        .collect();
    Ok(entries)
}

impl VoxelData {
    /// Drain recorded value diffs into packets sized by the configured budget.
    pub fn take_value_diff_packets(&self) -> Vec<Vec<DiffEntry<VoxelValue>>> {
        let budget = self.config().packet_budget_bytes;
        guard(&self.value_diffs).take_packets(budget, entry_bytes::<VoxelValue>())
    }

    /// Drain recorded material diffs into packets sized by the configured budget.
    pub fn take_material_diff_packets(&self) -> Vec<Vec<DiffEntry<VoxelMaterial>>> {
        let budget = self.config().packet_budget_bytes;
        guard(&self.material_diffs).take_packets(budget, entry_bytes::<VoxelMaterial>())
    }

    /// Apply value diffs received from another store.
    pub fn apply_value_diffs(&self, entries: &[DiffEntry<VoxelValue>]) -> Result<Vec<Aabb>> {
        self.apply_diffs(entries)
    }

    /// Apply material diffs received from another store.
    pub fn apply_material_diffs(&self, entries: &[DiffEntry<VoxelMaterial>]) -> Result<Vec<Aabb>> {
        self.apply_diffs(entries)
    }

    /// Write received entries; later entries for the same voxel win. The
    /// whole batch is validated before anything is written. Returns the
    /// bounds of the leaves touched.
    fn apply_diffs<T: VoxelChannel>(&self, entries: &[DiffEntry<T>]) -> Result<Vec<Aabb>> {
        if let Some(bad) = entries.iter().find(|e| e.index as usize >= CHUNK_VOLUME) {
            return Err(Error::MalformedPacket(format!("index {} out of range", bad.index)));
        }

        let mut order: Vec<&DiffEntry<T>> = entries.iter().collect();
        order.sort_by_key(|e| e.id);
        let ids: Vec<NodeId> = order.iter().map(|e| e.id).collect();
        let leaves = self.root().create_leaves_with_ids(&ids, self.stats_sink());
        if leaves.len() != ids.len() {
            let bad = ids.get(leaves.len()).copied().unwrap_or_default();
            return Err(Error::MalformedPacket(format!("{} is not a chunk of this world", bad)));
        }

        let generator = &**self.generator();
        let mut bounds = Vec::new();
        let mut offset = 0;
        for group in order.chunk_by(|a, b| a.id == b.id) {
            let leaf = leaves[offset];
            offset += group.len();
            let Some(lock) = leaf.data() else {
                continue;
            };
            let leaf_bounds = leaf.bounds();

            let mut data = write_leaf(lock);
            for entry in group {
                data.write::<T>(entry.index as usize, entry.value, true, leaf_bounds.min, generator);
            }
            drop(data);
            self.mark_dirty(leaf.id(), leaf_bounds);
            bounds.push(leaf_bounds);
        }
        log::debug!("Applied {} {} diffs to {} chunks", entries.len(), T::KIND.name(), bounds.len());
        Ok(bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use glam::IVec3;

    use crate::core::config::DataConfig;
    use crate::voxel::generator::EmptyGenerator;
    use crate::voxel::lock::LockKind;
    use crate::voxel::query::QueryZone;

    fn recorder(n: u32) -> DiffRecorder<u32> {
        let mut recorder = DiffRecorder::new();
        for i in 0..n {
            recorder.push(DiffEntry::new(NodeId(i as u64), i, i));
        }
        recorder
    }

    fn multiplayer_store(undo: bool) -> VoxelData {
        let config = DataConfig {
            enable_multiplayer: true,
            enable_undo_redo: undo,
            ..DataConfig::with_depth(3)
        };
        VoxelData::new(config, Arc::new(EmptyGenerator)).unwrap()
    }

    #[test]
    fn test_packet_capacity() {
        assert_eq!(packet_capacity(2048, 12), 170);
        assert_eq!(packet_count(400, 2048, 12), 3);
        assert_eq!(packet_count(0, 2048, 12), 0);
        assert_eq!(packet_capacity(8, 12), 1);
        assert_eq!(entry_bytes::<VoxelValue>(), 16);
    }

    #[test]
    fn test_take_packets_is_chronological() {
        let mut recorder = recorder(400);
        let packets = recorder.take_packets(2048, 12);

        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![60, 170, 170]);
        assert!(recorder.is_empty());

        let flat: Vec<u32> = packets.iter().flatten().map(|e| e.value).collect();
        let expected: Vec<u32> = (0..400).collect();
        assert_eq!(flat, expected);
    }

    #[test]
    fn test_take_packets_exact_fit() {
        let mut recorder = recorder(340);
        let packets = recorder.take_packets(2048, 12);
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.len() == 170));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let packet = vec![DiffEntry::new(NodeId(5), 9, VoxelValue(-2.5))];
        let bytes = encode_packet(&packet);
        assert_eq!(bytes.len(), PACKET_HEADER_BYTES + 16);
        assert_eq!(decode_packet::<VoxelValue>(&bytes).unwrap(), packet);

        assert!(decode_packet::<VoxelValue>(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_packet::<VoxelValue>(&[1, 0]).is_err());
    }

    #[test]
    fn test_replication_between_stores() {
        let host = multiplayer_store(false);
        let replica = multiplayer_store(false);
        let bounds = Aabb::new(IVec3::new(-20, 0, 0), IVec3::new(20, 4, 4));

        let lock = host.lock(LockKind::ReadWrite, bounds, "host").unwrap();
        host.set::<VoxelValue>(bounds, |p, v| *v = VoxelValue(-(p.x as f32)));
        host.set::<VoxelMaterial>(Aabb::from_point(IVec3::ONE), |_, m| *m = VoxelMaterial::rgb(5, 6, 7));
        host.set::<VoxelValue>(Aabb::from_point(IVec3::new(3, 0, 0)), |_, v| *v = VoxelValue(-100.0));
        host.unlock(lock);

        let lock = replica.lock(LockKind::ReadWrite, bounds, "replica").unwrap();
        for packet in host.take_value_diff_packets() {
            let decoded = decode_packet::<VoxelValue>(&encode_packet(&packet)).unwrap();
            replica.apply_value_diffs(&decoded).unwrap();
        }
        for packet in host.take_material_diff_packets() {
            replica.apply_material_diffs(&packet).unwrap();
        }

        let zone = QueryZone::full(bounds);
        let mut expected = vec![VoxelValue::default(); zone.len()];
        let mut actual = vec![VoxelValue::default(); zone.len()];
        let check = host.lock(LockKind::Read, bounds, "check").unwrap();
        host.get(&zone, 0, &mut expected);
        host.unlock(check);
        replica.get(&zone, 0, &mut actual);
        assert_eq!(expected, actual);
        assert_eq!(replica.get_value(IVec3::new(3, 0, 0), 0), VoxelValue(-100.0));
        assert_eq!(replica.get_material(IVec3::ONE, 0), VoxelMaterial::rgb(5, 6, 7));
        replica.unlock(lock);
    }

    #[test]
    fn test_undo_is_replicated() {
        let host = multiplayer_store(true);
        let replica = multiplayer_store(false);
        let world = host.world_bounds();
        let host_lock = host.lock(LockKind::ReadWrite, world, "host").unwrap();
        let replica_lock = replica.lock(LockKind::ReadWrite, world, "replica").unwrap();

        host.set::<VoxelValue>(Aabb::from_point(IVec3::ZERO), |_, v| *v = VoxelValue(-1.0));
        host.save_frame(Aabb::from_point(IVec3::ZERO));
        host.undo().unwrap();

        for packet in host.take_value_diff_packets() {
            replica.apply_value_diffs(&packet).unwrap();
        }
        assert_eq!(replica.get_value(IVec3::ZERO, 0), VoxelValue::EMPTY);

        host.unlock(host_lock);
        replica.unlock(replica_lock);
    }

    #[test]
    fn test_apply_rejects_bad_entries() {
        let store = multiplayer_store(false);
        let lock = store.lock(LockKind::ReadWrite, store.world_bounds(), "test").unwrap();

        let out_of_range = [DiffEntry::new(NodeId(1), 5000, VoxelValue(0.0))];
        assert!(store.apply_value_diffs(&out_of_range).is_err());

        // Not a level-0 id: last base-9 digit is zero.
        let coarse = [DiffEntry::new(NodeId(9), 0, VoxelValue(0.0))];
        assert!(matches!(store.apply_value_diffs(&coarse), Err(Error::MalformedPacket(_))));
        store.unlock(lock);
    }
}
