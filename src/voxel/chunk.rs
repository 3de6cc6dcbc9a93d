//! Dense per-chunk channel storage
//!
//! A level-0 leaf owns one [`LeafData`]: up to one 16³ array per built-in
//! channel plus any number of named custom f32 arrays. Arrays are allocated on
//! first write; a missing array means "use the generator default".

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytemuck::Pod;
use glam::IVec3;

use crate::math::Aabb;

use super::generator::{EmptyState, WorldGenerator};
use super::octree::{CHUNK_SIZE, CHUNK_VOLUME};
use super::stats::{MemoryKind, MemoryStats};
use super::voxel::{ChannelKind, ChannelValue, VoxelMaterial, VoxelValue};

/// Array index of a position relative to the chunk minimum corner.
#[inline]
pub fn index_of(local: IVec3) -> usize {
    debug_assert!(local.cmpge(IVec3::ZERO).all() && local.cmplt(IVec3::splat(CHUNK_SIZE)).all());
    (local.x + CHUNK_SIZE * (local.y + CHUNK_SIZE * local.z)) as usize
}

/// Inverse of [`index_of`].
#[inline]
pub fn local_of(index: usize) -> IVec3 {
    let i = index as i32;
    IVec3::new(i % CHUNK_SIZE, (i / CHUNK_SIZE) % CHUNK_SIZE, i / (CHUNK_SIZE * CHUNK_SIZE))
}

/// Array index of world position `p` in the chunk whose minimum corner is `min`.
#[inline]
pub fn chunk_index(min: IVec3, p: IVec3) -> usize {
    index_of(p - min)
}

/// Words in a per-voxel edit mask.
pub const EDIT_MASK_WORDS: usize = CHUNK_VOLUME / 64;

/// One allocated channel array and the voxels of it the user edited.
///
/// Voxels outside the edit mask hold generator or item output and may be
/// rewritten when items change. The channel is dirty while any bit is set.
#[derive(Debug)]
pub struct ChannelData<T> {
    data: Box<[T]>,
    edited: Option<Box<[u64]>>,
    edited_count: usize,
}

impl<T: Pod + Default> ChannelData<T> {
    fn new(zero: bool) -> Self {
        let fill = if zero { T::zeroed() } else { T::default() };
        Self {
            data: vec![fill; CHUNK_VOLUME].into_boxed_slice(),
            edited: None,
            edited_count: 0,
        }
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.edited_count > 0
    }

    pub fn is_edited(&self, index: usize) -> bool {
        self.edited
            .as_ref()
            .is_some_and(|mask| mask[index / 64] & (1 << (index % 64)) != 0)
    }

    fn set_edited(&mut self, index: usize, edited: bool) {
        if self.is_edited(index) == edited {
            return;
        }
        let mask = self
            .edited
            .get_or_insert_with(|| vec![0; EDIT_MASK_WORDS].into_boxed_slice());
        mask[index / 64] ^= 1 << (index % 64);
        if edited {
            self.edited_count += 1;
        } else {
            self.edited_count -= 1;
        }
    }

    fn edit_mask(&self) -> Option<&[u64]> {
        self.edited.as_deref().filter(|_| self.edited_count > 0)
    }

    fn set_edit_mask(&mut self, mask: &[u64]) {
        debug_assert_eq!(mask.len(), EDIT_MASK_WORDS);
        self.edited_count = mask.iter().map(|w| w.count_ones() as usize).sum();
        self.edited = (self.edited_count > 0).then(|| mask.into());
    }
}

/// Element type of a built-in channel.
pub trait VoxelChannel: Pod + Default + PartialEq + Send + Sync + 'static {
    const KIND: ChannelKind;

    /// Generator default at `p`.
    fn sample(generator: &dyn WorldGenerator, p: IVec3, lod: u8) -> Self;

    fn into_channel_value(self) -> ChannelValue;

    #[doc(hidden)]
    fn slot(leaf: &LeafData) -> &Option<ChannelData<Self>>;

    #[doc(hidden)]
    fn slot_mut(leaf: &mut LeafData) -> &mut Option<ChannelData<Self>>;
}

impl VoxelChannel for VoxelValue {
    const KIND: ChannelKind = ChannelKind::Value;

    fn sample(generator: &dyn WorldGenerator, p: IVec3, lod: u8) -> Self {
        generator.value(p, lod)
    }

    fn into_channel_value(self) -> ChannelValue {
        ChannelValue::Value(self)
    }

    fn slot(leaf: &LeafData) -> &Option<ChannelData<Self>> {
        &leaf.values
    }

    fn slot_mut(leaf: &mut LeafData) -> &mut Option<ChannelData<Self>> {
        leaf.uniform.store(UNIFORM_UNKNOWN, Ordering::Relaxed);
        &mut leaf.values
    }
}

impl VoxelChannel for VoxelMaterial {
    const KIND: ChannelKind = ChannelKind::Material;

    fn sample(generator: &dyn WorldGenerator, p: IVec3, lod: u8) -> Self {
        generator.material(p, lod)
    }

    fn into_channel_value(self) -> ChannelValue {
        ChannelValue::Material(self)
    }

    fn slot(leaf: &LeafData) -> &Option<ChannelData<Self>> {
        &leaf.materials
    }

    fn slot_mut(leaf: &mut LeafData) -> &mut Option<ChannelData<Self>> {
        &mut leaf.materials
    }
}

const UNIFORM_UNKNOWN: u8 = 0;
const UNIFORM_EMPTY: u8 = 1;
const UNIFORM_FULL: u8 = 2;
const UNIFORM_MIXED: u8 = 3;

fn custom_entry_overhead(name: &str) -> usize {
    std::mem::size_of::<String>() + name.len() + std::mem::size_of::<ChannelData<f32>>()
}

/// Channel storage of one level-0 leaf.
#[derive(Debug)]
pub struct LeafData {
    values: Option<ChannelData<VoxelValue>>,
    materials: Option<ChannelData<VoxelMaterial>>,
    custom: HashMap<String, ChannelData<f32>>,
    /// Boxes where edits are ignored
    protected: Vec<Aabb>,
    /// Cached emptiness of the value array
    uniform: AtomicU8,
    stats: Arc<MemoryStats>,
}

impl LeafData {
    pub fn new(stats: Arc<MemoryStats>) -> Self {
        Self {
            values: None,
            materials: None,
            custom: HashMap::new(),
            protected: Vec::new(),
            uniform: AtomicU8::new(UNIFORM_UNKNOWN),
            stats,
        }
    }

    pub fn channel<T: VoxelChannel>(&self) -> Option<&[T]> {
        T::slot(self).as_ref().map(ChannelData::as_slice)
    }

    pub fn channel_mut<T: VoxelChannel>(&mut self) -> Option<&mut [T]> {
        T::slot_mut(self).as_mut().map(|c| &mut c.data[..])
    }

    pub fn has_channel<T: VoxelChannel>(&self) -> bool {
        T::slot(self).is_some()
    }

    /// Allocate the array of channel `T`. With `zero` unset the array holds
    /// `T::default()` and the caller is expected to overwrite it.
    pub fn create_channel<T: VoxelChannel>(&mut self, zero: bool) -> &mut [T] {
        debug_assert!(!self.has_channel::<T>(), "{} channel already allocated", T::KIND.name());
        self.destroy_channel::<T>();
        self.stats.add(T::KIND.into(), CHUNK_VOLUME * std::mem::size_of::<T>());
        &mut T::slot_mut(self).insert(ChannelData::new(zero)).data
    }

    /// Existing array of `T`, or a new one filled by `init`.
    pub fn ensure_channel<T: VoxelChannel>(&mut self, init: impl FnOnce(&mut [T])) -> &mut [T] {
        if !self.has_channel::<T>() {
            init(self.create_channel::<T>(false));
        }
        self.channel_mut::<T>().unwrap_or_default()
    }

    /// Free the array of `T`; reads fall back to the generator again.
    pub fn destroy_channel<T: VoxelChannel>(&mut self) {
        if T::slot_mut(self).take().is_some() {
            self.stats.remove(T::KIND.into(), CHUNK_VOLUME * std::mem::size_of::<T>());
        }
    }

    /// True if any voxel of `T` holds a user edit.
    pub fn is_dirty<T: VoxelChannel>(&self) -> bool {
        T::slot(self).as_ref().is_some_and(ChannelData::is_dirty)
    }

    pub fn is_kind_dirty(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Value => self.is_dirty::<VoxelValue>(),
            ChannelKind::Material => self.is_dirty::<VoxelMaterial>(),
        }
    }

    pub fn is_edited<T: VoxelChannel>(&self, index: usize) -> bool {
        T::slot(self).as_ref().is_some_and(|c| c.is_edited(index))
    }

    /// Mark or unmark one voxel of `T` as user-edited. No-op without an array.
    pub fn set_edited<T: VoxelChannel>(&mut self, index: usize, edited: bool) {
        if let Some(channel) = T::slot_mut(self).as_mut() {
            channel.set_edited(index, edited);
        }
    }

    /// Bitmask of user-edited voxels of `T`, bit `i % 64` of word `i / 64`.
    /// `None` when nothing is edited.
    pub fn edit_mask<T: VoxelChannel>(&self) -> Option<&[u64]> {
        T::slot(self).as_ref().and_then(ChannelData::edit_mask)
    }

    /// Replace the edit mask of `T`. No-op without an array.
    pub fn set_edit_mask<T: VoxelChannel>(&mut self, mask: &[u64]) {
        if let Some(channel) = T::slot_mut(self).as_mut() {
            channel.set_edit_mask(mask);
        }
    }

    /// Write one element of a built-in channel, creating the array from
    /// `generator` if needed, and set its edit bit to `edited`.
    pub fn write_value(
        &mut self,
        index: usize,
        value: ChannelValue,
        edited: bool,
        min: IVec3,
        generator: &dyn WorldGenerator,
    ) {
        match value {
            ChannelValue::Value(v) => self.write::<VoxelValue>(index, v, edited, min, generator),
            ChannelValue::Material(m) => self.write::<VoxelMaterial>(index, m, edited, min, generator),
        }
    }

    pub(crate) fn write<T: VoxelChannel>(
        &mut self,
        index: usize,
        value: T,
        edited: bool,
        min: IVec3,
        generator: &dyn WorldGenerator,
    ) {
        let array = self.ensure_channel::<T>(|array| fill_from_generator(array, min, generator));
        array[index] = value;
        self.set_edited::<T>(index, edited);
    }

    /// Overwrite every voxel of `T` inside `local` that is not user-edited
    /// with `f(p)`. The array is created from `generator` if needed.
    pub fn paint_unedited<T: VoxelChannel>(
        &mut self,
        local: &Aabb,
        min: IVec3,
        generator: &dyn WorldGenerator,
        mut f: impl FnMut(IVec3) -> T,
    ) {
        self.ensure_channel::<T>(|array| fill_from_generator(array, min, generator));
        let Some(channel) = T::slot_mut(self).as_mut() else {
            return;
        };
        for z in local.min.z..local.max.z {
            for y in local.min.y..local.max.y {
                for x in local.min.x..local.max.x {
                    let p = IVec3::new(x, y, z);
                    let index = chunk_index(min, p);
                    if !channel.is_edited(index) {
                        channel.data[index] = f(p);
                    }
                }
            }
        }
    }

    pub fn custom_channel(&self, name: &str) -> Option<&[f32]> {
        self.custom.get(name).map(ChannelData::as_slice)
    }

    pub fn custom_channel_mut(&mut self, name: &str) -> Option<&mut [f32]> {
        self.custom.get_mut(name).map(|c| &mut c.data[..])
    }

    pub fn create_custom_channel(&mut self, name: &str, zero: bool) -> &mut [f32] {
        debug_assert!(!self.custom.contains_key(name), "custom channel {} already allocated", name);
        self.destroy_custom_channel(name);
        self.stats.add(MemoryKind::Custom, CHUNK_VOLUME * std::mem::size_of::<f32>());
        self.stats.add(MemoryKind::MapOverhead, custom_entry_overhead(name));
        &mut self.custom.entry(name.to_string()).or_insert(ChannelData::new(zero)).data
    }

    pub fn ensure_custom_channel(&mut self, name: &str, init: impl FnOnce(&mut [f32])) -> &mut [f32] {
        if !self.custom.contains_key(name) {
            init(self.create_custom_channel(name, false));
        }
        self.custom_channel_mut(name).unwrap_or_default()
    }

    pub fn destroy_custom_channel(&mut self, name: &str) {
        if self.custom.remove(name).is_some() {
            self.stats.remove(MemoryKind::Custom, CHUNK_VOLUME * std::mem::size_of::<f32>());
            self.stats.remove(MemoryKind::MapOverhead, custom_entry_overhead(name));
        }
    }

    /// Custom channels sorted by name
    pub fn custom_channels(&self) -> Vec<(&str, &[f32])> {
        let mut channels: Vec<_> = self
            .custom
            .iter()
            .map(|(name, c)| (name.as_str(), c.as_slice()))
            .collect();
        channels.sort_by(|a, b| a.0.cmp(b.0));
        channels
    }

    pub fn has_custom_channels(&self) -> bool {
        !self.custom.is_empty()
    }

    /// True if any array is allocated
    pub fn is_allocated(&self) -> bool {
        self.values.is_some() || self.materials.is_some() || !self.custom.is_empty()
    }

    /// Free every array.
    pub fn clear_all_channels(&mut self) {
        self.destroy_channel::<VoxelValue>();
        self.destroy_channel::<VoxelMaterial>();
        let names: Vec<String> = self.custom.keys().cloned().collect();
        for name in names {
            self.destroy_custom_channel(&name);
        }
    }

    pub fn protected_boxes(&self) -> &[Aabb] {
        &self.protected
    }

    pub fn add_protected(&mut self, bounds: Aabb) {
        self.protected.push(bounds);
    }

    pub fn set_protected(&mut self, boxes: Vec<Aabb>) {
        self.protected = boxes;
    }

    pub fn is_protected(&self, p: IVec3) -> bool {
        self.protected.iter().any(|b| b.contains_point(p))
    }

    /// Emptiness of the allocated value array, computed once per modification.
    /// `None` when the value channel is not allocated.
    pub fn value_state(&self) -> Option<EmptyState> {
        let values = self.channel::<VoxelValue>()?;
        let cached = self.uniform.load(Ordering::Relaxed);
        let state = match cached {
            UNIFORM_EMPTY => EmptyState::Empty,
            UNIFORM_FULL => EmptyState::Full,
            UNIFORM_MIXED => EmptyState::Mixed,
            _ => {
                let first = values[0].is_empty();
                let uniform = values.iter().all(|v| v.is_empty() == first);
                let (state, marker) = match (uniform, first) {
                    (true, true) => (EmptyState::Empty, UNIFORM_EMPTY),
                    (true, false) => (EmptyState::Full, UNIFORM_FULL),
                    _ => (EmptyState::Mixed, UNIFORM_MIXED),
                };
                self.uniform.store(marker, Ordering::Relaxed);
                state
            }
        };
        Some(state)
    }
}

impl Drop for LeafData {
    fn drop(&mut self) {
        self.clear_all_channels();
    }
}

/// Fill a chunk array with generator defaults for the chunk at `min`.
pub fn fill_from_generator<T: VoxelChannel>(array: &mut [T], min: IVec3, generator: &dyn WorldGenerator) {
    for (index, slot) in array.iter_mut().enumerate() {
        *slot = T::sample(generator, min + local_of(index), 0);
    }
}

/// Fill a custom array with generator defaults for the chunk at `min`.
pub fn fill_custom_from_generator(name: &str, array: &mut [f32], min: IVec3, generator: &dyn WorldGenerator) {
    for (index, slot) in array.iter_mut().enumerate() {
        *slot = generator.custom(name, min + local_of(index), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::generator::FlatGenerator;

    fn leaf() -> (LeafData, Arc<MemoryStats>) {
        let stats = Arc::new(MemoryStats::new());
        (LeafData::new(Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_index_roundtrip() {
        assert_eq!(index_of(IVec3::new(1, 0, 0)), 1);
        assert_eq!(index_of(IVec3::new(0, 1, 0)), 16);
        assert_eq!(index_of(IVec3::new(0, 0, 1)), 256);
        assert_eq!(index_of(IVec3::splat(15)), CHUNK_VOLUME - 1);
        for i in [0, 17, 300, 4095] {
            assert_eq!(index_of(local_of(i)), i);
        }
    }

    #[test]
    fn test_channels_are_lazy() {
        let (mut leaf, stats) = leaf();
        assert!(leaf.channel::<VoxelValue>().is_none());
        assert!(!leaf.is_allocated());
        assert_eq!(stats.snapshot().total(), 0);

        let values = leaf.create_channel::<VoxelValue>(true);
        assert_eq!(values.len(), CHUNK_VOLUME);
        assert!(values.iter().all(|v| v.0 == 0.0));
        assert_eq!(stats.used(MemoryKind::Values), CHUNK_VOLUME * 4);
        assert_eq!(stats.used(MemoryKind::Materials), 0);
    }

    #[test]
    fn test_stats_released_on_drop() {
        let (mut leaf, stats) = leaf();
        leaf.create_channel::<VoxelMaterial>(true);
        leaf.create_custom_channel("heat", true);
        assert!(stats.used(MemoryKind::MapOverhead) > 0);
        drop(leaf);
        assert_eq!(stats.snapshot().total(), 0);
    }

    #[test]
    fn test_write_copies_generator_default() {
        let (mut leaf, _stats) = leaf();
        let generator = FlatGenerator::new(0, VoxelMaterial::default());
        let min = IVec3::new(0, -8, 0);
        leaf.write::<VoxelValue>(0, VoxelValue(-5.0), true, min, &generator);

        let values = leaf.channel::<VoxelValue>().unwrap();
        assert_eq!(values[0], VoxelValue(-5.0));
        // Index 16 is (0, 1, 0) local, i.e. y = -7 in the world.
        assert_eq!(values[16], VoxelValue(-7.0));
        assert!(leaf.is_dirty::<VoxelValue>());
        assert!(leaf.is_edited::<VoxelValue>(0));
        assert!(!leaf.is_edited::<VoxelValue>(16));
        assert!(!leaf.is_dirty::<VoxelMaterial>());
    }

    #[test]
    fn test_edit_mask_tracks_single_voxels() {
        let (mut leaf, _stats) = leaf();
        let generator = FlatGenerator::new(0, VoxelMaterial::default());
        let min = IVec3::ZERO;
        leaf.write::<VoxelValue>(3, VoxelValue(1.0), true, min, &generator);
        leaf.write::<VoxelValue>(70, VoxelValue(1.0), true, min, &generator);

        let mask = leaf.edit_mask::<VoxelValue>().unwrap();
        assert_eq!(mask.len(), EDIT_MASK_WORDS);
        assert_eq!(mask[0], 1 << 3);
        assert_eq!(mask[1], 1 << 6);

        leaf.set_edited::<VoxelValue>(3, false);
        leaf.set_edited::<VoxelValue>(70, false);
        assert!(!leaf.is_dirty::<VoxelValue>());
        assert!(leaf.edit_mask::<VoxelValue>().is_none());

        let mut restored = vec![0u64; EDIT_MASK_WORDS];
        restored[63] = u64::MAX;
        leaf.set_edit_mask::<VoxelValue>(&restored);
        assert!(leaf.is_edited::<VoxelValue>(CHUNK_VOLUME - 1));
        assert!(!leaf.is_edited::<VoxelValue>(0));
    }

    #[test]
    fn test_paint_unedited_skips_edited_voxels() {
        let (mut leaf, _stats) = leaf();
        let generator = FlatGenerator::new(0, VoxelMaterial::default());
        let min = IVec3::ZERO;
        leaf.write::<VoxelValue>(0, VoxelValue(-9.0), true, min, &generator);

        let whole = Aabb::new(min, min + IVec3::splat(CHUNK_SIZE));
        leaf.paint_unedited::<VoxelValue>(&whole, min, &generator, |_| VoxelValue(2.0));

        let values = leaf.channel::<VoxelValue>().unwrap();
        assert_eq!(values[0], VoxelValue(-9.0));
        assert!(values[1..].iter().all(|v| *v == VoxelValue(2.0)));
    }

    #[test]
    fn test_value_state_cache_invalidated_on_write() {
        let (mut leaf, _stats) = leaf();
        leaf.ensure_channel::<VoxelValue>(|a| a.fill(VoxelValue::EMPTY));
        assert_eq!(leaf.value_state(), Some(EmptyState::Empty));

        leaf.channel_mut::<VoxelValue>().unwrap()[10] = VoxelValue::FULL;
        assert_eq!(leaf.value_state(), Some(EmptyState::Mixed));

        leaf.channel_mut::<VoxelValue>().unwrap().fill(VoxelValue::FULL);
        assert_eq!(leaf.value_state(), Some(EmptyState::Full));
    }

    #[test]
    fn test_custom_channels_sorted() {
        let (mut leaf, _stats) = leaf();
        leaf.ensure_custom_channel("wetness", |a| a.fill(1.0));
        leaf.ensure_custom_channel("heat", |a| a.fill(2.0));
        let names: Vec<&str> = leaf.custom_channels().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["heat", "wetness"]);
        assert_eq!(leaf.custom_channel("heat").unwrap()[5], 2.0);
    }

    #[test]
    fn test_protection() {
        let (mut leaf, _stats) = leaf();
        leaf.add_protected(Aabb::new(IVec3::ZERO, IVec3::splat(2)));
        assert!(leaf.is_protected(IVec3::ONE));
        assert!(!leaf.is_protected(IVec3::splat(2)));
    }
}
