//! The voxel store
//!
//! [`VoxelData`] owns the octree, the generator that supplies unedited
//! values, the region lock registry and the edit bookkeeping (undo log,
//! network diffs, dirty tracking, items).
//!
//! Callers take a region lock covering what they touch before calling
//! `get`/`set`/`is_empty`; debug builds assert it. Structural clears take
//! `&mut self` instead.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use glam::IVec3;

use crate::core::config::DataConfig;
use crate::core::types::Result;
use crate::math::Aabb;

use super::chunk::{LeafData, VoxelChannel, chunk_index, fill_custom_from_generator, fill_from_generator};
use super::edit::delta::{DiffEntry, DiffRecorder};
use super::edit::invalidator::ChunkInvalidator;
use super::edit::overlay::ItemOverlay;
use super::edit::undo::{ModifiedVoxel, UndoRedoLog};
use super::generator::{EmptyState, WorldGenerator};
use super::lock::{LockHandle, LockKind, RegionLocks};
use super::octree::{Node, NodeId, bounds_of};
use super::query::QueryZone;
use super::stats::{MemorySnapshot, MemoryStats};
use super::voxel::{ChannelValue, VoxelMaterial, VoxelValue};

pub(crate) fn read_leaf(lock: &RwLock<LeafData>) -> RwLockReadGuard<'_, LeafData> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_leaf(lock: &RwLock<LeafData>) -> RwLockWriteGuard<'_, LeafData> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sparse octree voxel store.
pub struct VoxelData {
    config: DataConfig,
    generator: Arc<dyn WorldGenerator>,
    stats: Arc<MemoryStats>,
    root: Node,
    locks: RegionLocks,
    pub(crate) undo: Mutex<UndoRedoLog>,
    pub(crate) value_diffs: Mutex<DiffRecorder<VoxelValue>>,
    pub(crate) material_diffs: Mutex<DiffRecorder<VoxelMaterial>>,
    pub(crate) items: ItemOverlay,
    invalidator: Mutex<ChunkInvalidator>,
}

impl VoxelData {
    /// Create an empty store with its own memory statistics.
    pub fn new(config: DataConfig, generator: Arc<dyn WorldGenerator>) -> Result<Self> {
        Self::with_stats(config, generator, Arc::new(MemoryStats::new()))
    }

    /// Create an empty store reporting allocations into `stats`.
    pub fn with_stats(
        config: DataConfig,
        generator: Arc<dyn WorldGenerator>,
        stats: Arc<MemoryStats>,
    ) -> Result<Self> {
        config.validate()?;
        let root = Node::root(config.depth, &stats);
        log::info!(
            "Created voxel store: depth {}, {} voxels per side, undo {}, multiplayer {}",
            config.depth,
            root.size(),
            config.enable_undo_redo,
            config.enable_multiplayer
        );
        Ok(Self {
            config,
            generator,
            stats,
            root,
            locks: RegionLocks::new(),
            undo: Mutex::new(UndoRedoLog::new()),
            value_diffs: Mutex::new(DiffRecorder::new()),
            material_diffs: Mutex::new(DiffRecorder::new()),
            items: ItemOverlay::new(),
            invalidator: Mutex::new(ChunkInvalidator::new()),
        })
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Level of the root node
    pub fn depth(&self) -> u8 {
        self.config.depth
    }

    pub fn generator(&self) -> &Arc<dyn WorldGenerator> {
        &self.generator
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Every position the octree can hold.
    pub fn world_bounds(&self) -> Aabb {
        bounds_of(IVec3::ZERO, self.config.depth)
    }

    pub fn locks(&self) -> &RegionLocks {
        &self.locks
    }

    pub(crate) fn stats_sink(&self) -> &Arc<MemoryStats> {
        &self.stats
    }

    // --- Region locks ---

    /// Lock `bounds`, waiting as long as it takes.
    pub fn lock(&self, kind: LockKind, bounds: Aabb, label: &str) -> Result<LockHandle> {
        self.locks.acquire(kind, bounds, label, None)
    }

    /// Lock `bounds`, giving up after `timeout`.
    pub fn try_lock(&self, kind: LockKind, bounds: Aabb, label: &str, timeout: Duration) -> Result<LockHandle> {
        self.locks.acquire(kind, bounds, label, Some(Instant::now() + timeout))
    }

    pub fn unlock(&self, handle: LockHandle) {
        self.locks.release(handle);
    }

    // --- Reads ---

    /// Fill `out` with channel `T` sampled over `zone`.
    ///
    /// Leaves without an array for `T`, and positions outside the world,
    /// read the generator default. No nodes are created.
    pub fn get<T: VoxelChannel>(&self, zone: &QueryZone, lod: u8, out: &mut [T]) {
        debug_assert_eq!(out.len(), zone.len(), "output buffer does not match zone");
        debug_assert!(
            self.locks.is_locked(LockKind::Read, zone.bounds()),
            "get without a lock on {}",
            zone.bounds()
        );

        let world = self.world_bounds();
        if !world.contains(zone.bounds()) {
            for p in zone.positions().filter(|p| !world.contains_point(*p)) {
                out[zone.index_of(p)] = T::sample(&*self.generator, p, lod);
            }
        }
        self.get_in(&self.root, zone, lod, out);
    }

    fn get_in<T: VoxelChannel>(&self, node: &Node, zone: &QueryZone, lod: u8, out: &mut [T]) {
        let Some(sub) = zone.restrict(&node.bounds()) else {
            return;
        };
        if let Some(children) = node.children() {
            for child in children {
                self.get_in(child, zone, lod, out);
            }
            return;
        }

        let data = node.data().map(read_leaf);
        match data.as_ref().and_then(|d| d.channel::<T>()) {
            Some(array) => {
                let min = node.bounds().min;
                for p in sub.positions() {
                    out[zone.index_of(p)] = array[chunk_index(min, p)];
                }
            }
            None => {
                for p in sub.positions() {
                    out[zone.index_of(p)] = T::sample(&*self.generator, p, lod);
                }
            }
        }
    }

    /// Fill `out` with custom channel `name` sampled over `zone`.
    pub fn get_custom(&self, name: &str, zone: &QueryZone, lod: u8, out: &mut [f32]) {
        debug_assert_eq!(out.len(), zone.len(), "output buffer does not match zone");
        debug_assert!(self.locks.is_locked(LockKind::Read, zone.bounds()));

        let world = self.world_bounds();
        if !world.contains(zone.bounds()) {
            for p in zone.positions().filter(|p| !world.contains_point(*p)) {
                out[zone.index_of(p)] = self.generator.custom(name, p, lod);
            }
        }
        self.get_custom_in(name, &self.root, zone, lod, out);
    }

    fn get_custom_in(&self, name: &str, node: &Node, zone: &QueryZone, lod: u8, out: &mut [f32]) {
        let Some(sub) = zone.restrict(&node.bounds()) else {
            return;
        };
        if let Some(children) = node.children() {
            for child in children {
                self.get_custom_in(name, child, zone, lod, out);
            }
            return;
        }

        let data = node.data().map(read_leaf);
        match data.as_ref().and_then(|d| d.custom_channel(name)) {
            Some(array) => {
                let min = node.bounds().min;
                for p in sub.positions() {
                    out[zone.index_of(p)] = array[chunk_index(min, p)];
                }
            }
            None => {
                for p in sub.positions() {
                    out[zone.index_of(p)] = self.generator.custom(name, p, lod);
                }
            }
        }
    }

    /// Single element of channel `T` at `p`.
    pub fn get_at<T: VoxelChannel>(&self, p: IVec3, lod: u8) -> T {
        debug_assert!(self.locks.is_locked(LockKind::Read, &Aabb::from_point(p)));
        if !self.world_bounds().contains_point(p) {
            return T::sample(&*self.generator, p, lod);
        }
        let node = self.root.leaf_at(p);
        if let Some(lock) = node.data() {
            let data = read_leaf(lock);
            if let Some(array) = data.channel::<T>() {
                return array[chunk_index(node.bounds().min, p)];
            }
        }
        T::sample(&*self.generator, p, lod)
    }

    pub fn get_value(&self, p: IVec3, lod: u8) -> VoxelValue {
        self.get_at(p, lod)
    }

    pub fn get_material(&self, p: IVec3, lod: u8) -> VoxelMaterial {
        self.get_at(p, lod)
    }

    // --- Writes ---

    fn tracks_edits(&self) -> bool {
        self.config.enable_undo_redo || self.config.enable_multiplayer
    }

    /// Apply `f` to every voxel of channel `T` inside `bounds`.
    ///
    /// Leaves and arrays are created on demand, starting from the generator
    /// default. Voxels inside disable-edits boxes are skipped.
    pub fn set<T: VoxelChannel>(&self, bounds: Aabb, mut f: impl FnMut(IVec3, &mut T)) {
        debug_assert!(
            self.locks.is_locked(LockKind::ReadWrite, &bounds),
            "set without a read-write lock on {}",
            bounds
        );
        let bounds = bounds.overlap(&self.world_bounds());
        if bounds.is_empty() {
            return;
        }

        let mut leaves = Vec::new();
        self.root.create_leaves_overlapping(&bounds, &self.stats, &mut leaves);

        let mut edits = Vec::new();
        for leaf in leaves {
            self.set_in_leaf(leaf, &bounds, &mut f, &mut edits);
        }
        log::debug!("Set {} on {} ({} recorded changes)", T::KIND.name(), bounds, edits.len());
        self.record_edits(edits);
    }

    pub(crate) fn set_in_leaf<T: VoxelChannel>(
        &self,
        leaf: &Node,
        bounds: &Aabb,
        f: &mut impl FnMut(IVec3, &mut T),
        edits: &mut Vec<ModifiedVoxel>,
    ) {
        let Some(lock) = leaf.data() else {
            return;
        };
        let leaf_bounds = leaf.bounds();
        let local = bounds.overlap(&leaf_bounds);
        if local.is_empty() {
            return;
        }

        let min = leaf_bounds.min;
        let generator = &*self.generator;
        let track = self.tracks_edits();
        let mut changed = false;

        let mut data = write_leaf(lock);
        let protected: Vec<Aabb> = data
            .protected_boxes()
            .iter()
            .filter(|b| b.intersects(&local))
            .copied()
            .collect();
        data.ensure_channel::<T>(|a| fill_from_generator(a, min, generator));

        for z in local.min.z..local.max.z {
            for y in local.min.y..local.max.y {
                for x in local.min.x..local.max.x {
                    let p = IVec3::new(x, y, z);
                    if protected.iter().any(|b| b.contains_point(p)) {
                        continue;
                    }
                    let index = chunk_index(min, p);
                    let Some(array) = data.channel_mut::<T>() else {
                        return;
                    };
                    let old = array[index];
                    f(p, &mut array[index]);
                    let new = array[index];
                    if new != old {
                        changed = true;
                        let old_edited = data.is_edited::<T>(index);
                        data.set_edited::<T>(index, true);
                        if track {
                            edits.push(ModifiedVoxel {
                                id: leaf.id(),
                                index: index as u32,
                                old: old.into_channel_value(),
                                new: new.into_channel_value(),
                                old_edited,
                            });
                        }
                    }
                }
            }
        }

        if changed {
            drop(data);
            self.mark_dirty(leaf.id(), leaf_bounds);
        }
    }

    /// Apply `f` to every voxel of custom channel `name` inside `bounds`.
    ///
    /// Custom channels are not tracked by undo/redo or network diffs.
    pub fn set_custom(&self, name: &str, bounds: Aabb, mut f: impl FnMut(IVec3, &mut f32)) {
        debug_assert!(
            self.locks.is_locked(LockKind::ReadWrite, &bounds),
            "set without a read-write lock on {}",
            bounds
        );
        let bounds = bounds.overlap(&self.world_bounds());
        if bounds.is_empty() {
            return;
        }

        let mut leaves = Vec::new();
        self.root.create_leaves_overlapping(&bounds, &self.stats, &mut leaves);

        for leaf in leaves {
            let Some(lock) = leaf.data() else {
                continue;
            };
            let leaf_bounds = leaf.bounds();
            let local = bounds.overlap(&leaf_bounds);
            let min = leaf_bounds.min;
            let generator = &*self.generator;

            let mut changed = false;
            let mut data = write_leaf(lock);
            let protected: Vec<Aabb> = data.protected_boxes().to_vec();
            let array = data.ensure_custom_channel(name, |a| fill_custom_from_generator(name, a, min, generator));
            for z in local.min.z..local.max.z {
                for y in local.min.y..local.max.y {
                    for x in local.min.x..local.max.x {
                        let p = IVec3::new(x, y, z);
                        if protected.iter().any(|b| b.contains_point(p)) {
                            continue;
                        }
                        let slot = &mut array[chunk_index(min, p)];
                        let old = *slot;
                        f(p, slot);
                        changed |= slot.to_bits() != old.to_bits();
                    }
                }
            }
            drop(data);
            if changed {
                self.mark_dirty(leaf.id(), leaf_bounds);
            }
        }
    }

    /// Write recorded changes into the undo log and network recorders.
    pub(crate) fn record_edits(&self, edits: Vec<ModifiedVoxel>) {
        if edits.is_empty() {
            return;
        }
        if self.config.enable_multiplayer {
            self.record_network_diffs(&edits, false);
        }
        if self.config.enable_undo_redo {
            guard(&self.undo).record(edits);
        }
    }

    /// Push the new (or, with `use_old`, the old) side of each change to the
    /// network recorders.
    pub(crate) fn record_network_diffs(&self, edits: &[ModifiedVoxel], use_old: bool) {
        let mut values = guard(&self.value_diffs);
        let mut materials = guard(&self.material_diffs);
        for edit in edits {
            let value = if use_old { edit.old } else { edit.new };
            match value {
                ChannelValue::Value(v) => values.push(DiffEntry::new(edit.id, edit.index, v)),
                ChannelValue::Material(m) => materials.push(DiffEntry::new(edit.id, edit.index, m)),
            }
        }
    }

    // --- Queries ---

    /// Classify `bounds` by the value channel.
    pub fn is_empty(&self, bounds: &Aabb, lod: u8) -> EmptyState {
        debug_assert!(self.locks.is_locked(LockKind::Read, bounds));
        debug_assert!(
            bounds.is_multiple_of(1 << lod),
            "{} is not aligned to lod {}",
            bounds,
            lod
        );
        if bounds.is_empty() {
            return EmptyState::Empty;
        }

        let world = self.world_bounds();
        let mut state: Option<EmptyState> = None;
        let mut merge = |s: EmptyState| {
            state = Some(match state {
                None => s,
                Some(prev) => prev.combine(s),
            });
        };

        let inside = bounds.overlap(&world);
        if !inside.is_empty() {
            merge(self.is_empty_in(&self.root, &inside, lod));
        }
        for outside in bounds.subtract(&world).iter().filter(|b| !b.is_empty()) {
            merge(self.generator.is_empty(outside, lod));
        }
        state.unwrap_or(EmptyState::Mixed)
    }

    fn is_empty_in(&self, node: &Node, bounds: &Aabb, lod: u8) -> EmptyState {
        let Some(children) = node.children() else {
            if let Some(state) = node.data().and_then(|lock| read_leaf(lock).value_state()) {
                return state;
            }
            return self.generator.is_empty(&bounds.overlap(&node.bounds()), lod);
        };

        let mut state: Option<EmptyState> = None;
        for child in children.iter().filter(|c| c.bounds().intersects(bounds)) {
            let s = self.is_empty_in(child, bounds, lod);
            let combined = state.map_or(s, |prev| prev.combine(s));
            if combined == EmptyState::Mixed {
                return EmptyState::Mixed;
            }
            state = Some(combined);
        }
        state.unwrap_or(EmptyState::Mixed)
    }

    /// Existing leaves covering each of the ascending `ids`, in one traversal.
    pub fn leaves_with_ids(&self, ids: &[NodeId]) -> Vec<&Node> {
        self.root.leaves_with_ids(ids)
    }

    /// Call `f` for every level-0 leaf intersecting `bounds` that has any
    /// array allocated, in ascending id order.
    pub fn for_each_created_chunk(&self, bounds: &Aabb, mut f: impl FnMut(&Node, &LeafData)) {
        debug_assert!(self.locks.is_locked(LockKind::Read, bounds));
        let mut leaves = Vec::new();
        self.root.leaves_overlapping(bounds, &mut leaves);
        for leaf in leaves {
            if let Some(lock) = leaf.data() {
                let data = read_leaf(lock);
                if data.is_allocated() {
                    f(leaf, &data);
                }
            }
        }
    }

    /// Number of level-0 leaves in the tree.
    pub fn num_chunks(&self) -> usize {
        self.root.count_chunks()
    }

    pub fn memory_stats(&self) -> MemorySnapshot {
        self.stats.snapshot()
    }

    // --- Dirty tracking ---

    pub(crate) fn mark_dirty(&self, id: NodeId, bounds: Aabb) {
        guard(&self.invalidator).mark_dirty(id, bounds);
    }

    /// Bounds of every leaf changed since the last call.
    pub fn take_dirty_bounds(&self) -> Vec<Aabb> {
        guard(&self.invalidator).take_dirty()
    }

    /// Change counter of a leaf, for cache validation.
    pub fn chunk_generation(&self, id: NodeId) -> u32 {
        guard(&self.invalidator).generation(id)
    }

    // --- Structural clears ---

    fn reset_tree(&mut self) {
        debug_assert_eq!(self.locks.outstanding(), (0, 0), "structural clear while locks are held");
        self.root = Node::root(self.config.depth, &self.stats);
        self.undo
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_frames();
        self.value_diffs.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
        self.material_diffs.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
        let invalidator = self.invalidator.get_mut().unwrap_or_else(PoisonError::into_inner);
        invalidator.clear();
        invalidator.mark_dirty(NodeId::ROOT, bounds_of(IVec3::ZERO, self.config.depth));
    }

    /// Drop all voxel data and history but keep the items, re-baking them.
    pub fn clear_octree_data(&mut self) {
        self.reset_tree();
        self.rebake_items();
        log::info!("Cleared voxel data, kept {} items", self.items.len());
    }

    /// Drop everything: voxel data, history and items.
    pub fn clear_data(&mut self) {
        self.reset_tree();
        self.items.clear();
        log::info!("Cleared voxel data and items");
    }

    /// Point accessor caching the last visited leaf.
    pub fn accelerator(&self) -> LeafAccelerator<'_> {
        LeafAccelerator { data: self, leaf: None }
    }
}

/// Point reads and writes that reuse the previous leaf when consecutive
/// positions fall inside it.
pub struct LeafAccelerator<'a> {
    data: &'a VoxelData,
    leaf: Option<&'a Node>,
}

impl<'a> LeafAccelerator<'a> {
    fn cached(&self, p: IVec3) -> Option<&'a Node> {
        self.leaf.filter(|leaf| leaf.bounds().contains_point(p))
    }

    /// Read channel `T` at `p`.
    pub fn get<T: VoxelChannel>(&mut self, p: IVec3, lod: u8) -> T {
        let data = self.data;
        debug_assert!(data.locks.is_locked(LockKind::Read, &Aabb::from_point(p)));
        if !data.world_bounds().contains_point(p) {
            return T::sample(&*data.generator, p, lod);
        }
        // A cached coarse leaf may have been subdivided since.
        let node = match self.cached(p) {
            Some(leaf) if leaf.is_leaf() => leaf,
            _ => data.root.leaf_at(p),
        };
        self.leaf = Some(node);

        if let Some(lock) = node.data() {
            if let Some(array) = read_leaf(lock).channel::<T>() {
                return array[chunk_index(node.bounds().min, p)];
            }
        }
        T::sample(&*data.generator, p, lod)
    }

    /// Write channel `T` at `p`, with the same bookkeeping as [`VoxelData::set`].
    pub fn set<T: VoxelChannel>(&mut self, p: IVec3, value: T) {
        let data = self.data;
        debug_assert!(data.locks.is_locked(LockKind::ReadWrite, &Aabb::from_point(p)));
        if !data.world_bounds().contains_point(p) {
            return;
        }
        let node = match self.cached(p) {
            Some(leaf) if leaf.level() == 0 => leaf,
            _ => data.root.create_leaf_at(p, &data.stats),
        };
        self.leaf = Some(node);

        let mut edits = Vec::new();
        data.set_in_leaf(node, &Aabb::from_point(p), &mut |_, v: &mut T| *v = value, &mut edits);
        data.record_edits(edits);
    }

    pub fn get_value(&mut self, p: IVec3) -> VoxelValue {
        self.get(p, 0)
    }

    pub fn set_value(&mut self, p: IVec3, value: VoxelValue) {
        self.set(p, value);
    }

    pub fn get_material(&mut self, p: IVec3) -> VoxelMaterial {
        self.get(p, 0)
    }

    pub fn set_material(&mut self, p: IVec3, material: VoxelMaterial) {
        self.set(p, material);
    }
}
