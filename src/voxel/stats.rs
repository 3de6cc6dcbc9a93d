//! Memory accounting for chunk storage
//!
//! Chunk storage reports every array allocation and release here. The sink is
//! shared (`Arc`) between a store and all of its leaves, so several stores can
//! report into one sink or each keep their own.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::voxel::ChannelKind;

/// Kind of allocation being accounted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Values,
    Materials,
    Custom,
    /// Bookkeeping of the custom channel maps
    MapOverhead,
}

impl From<ChannelKind> for MemoryKind {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Value => MemoryKind::Values,
            ChannelKind::Material => MemoryKind::Materials,
        }
    }
}

/// Thread-safe byte counters per allocation kind
#[derive(Debug, Default)]
pub struct MemoryStats {
    values: AtomicUsize,
    materials: AtomicUsize,
    custom: AtomicUsize,
    map_overhead: AtomicUsize,
}

/// Point-in-time copy of [`MemoryStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub values: usize,
    pub materials: usize,
    pub custom: usize,
    pub map_overhead: usize,
}

impl MemorySnapshot {
    /// Sum of all kinds in bytes
    pub fn total(&self) -> usize {
        self.values + self.materials + self.custom + self.map_overhead
    }
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: MemoryKind) -> &AtomicUsize {
        match kind {
            MemoryKind::Values => &self.values,
            MemoryKind::Materials => &self.materials,
            MemoryKind::Custom => &self.custom,
            MemoryKind::MapOverhead => &self.map_overhead,
        }
    }

    /// Add allocated bytes
    pub fn add(&self, kind: MemoryKind, bytes: usize) {
        self.counter(kind).fetch_add(bytes, Ordering::Relaxed);
    }

    /// Remove released bytes, saturating at zero
    pub fn remove(&self, kind: MemoryKind, bytes: usize) {
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Current usage of one kind in bytes
    pub fn used(&self, kind: MemoryKind) -> usize {
        self.counter(kind).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            values: self.used(MemoryKind::Values),
            materials: self.used(MemoryKind::Materials),
            custom: self.used(MemoryKind::Custom),
            map_overhead: self.used(MemoryKind::MapOverhead),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let stats = MemoryStats::new();
        stats.add(MemoryKind::Values, 100);
        stats.add(MemoryKind::Custom, 10);
        stats.remove(MemoryKind::Values, 40);

        let snap = stats.snapshot();
        assert_eq!(snap.values, 60);
        assert_eq!(snap.custom, 10);
        assert_eq!(snap.total(), 70);
    }

    #[test]
    fn test_remove_saturates() {
        let stats = MemoryStats::new();
        stats.add(MemoryKind::Materials, 5);
        stats.remove(MemoryKind::Materials, 50);
        assert_eq!(stats.used(MemoryKind::Materials), 0);
    }

    #[test]
    fn test_channel_kind_mapping() {
        assert_eq!(MemoryKind::from(ChannelKind::Value), MemoryKind::Values);
        assert_eq!(MemoryKind::from(ChannelKind::Material), MemoryKind::Materials);
    }
}
