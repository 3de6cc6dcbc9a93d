//! Items placed over the generated world.
//!
//! Items live in one ordered collection per type. Adding an item bakes it
//! into the leaves it overlaps right away:
//! - [`AssetItem`]s evaluate their own generator into the chunk arrays,
//! - [`DisableEditsItem`]s add protected boxes that `set` skips,
//! - [`DataItem`]s only carry a payload for other systems to query.
//!
//! Removing an item re-derives each affected leaf from scratch: base
//! generator, then the remaining assets in insertion order. Voxels the user
//! edited keep their value throughout.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use glam::IVec3;
use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::Aabb;
use crate::voxel::chunk::{LeafData, VoxelChannel};
use crate::voxel::data::{VoxelData, write_leaf};
use crate::voxel::generator::WorldGenerator;
use crate::voxel::lock::LockKind;
use crate::voxel::octree::Node;
use crate::voxel::voxel::{VoxelMaterial, VoxelValue};

/// Generator output pasted over a box of the world.
pub struct AssetItem {
    pub bounds: Aabb,
    pub generator: Arc<dyn WorldGenerator>,
}

impl AssetItem {
    pub fn new(bounds: Aabb, generator: Arc<dyn WorldGenerator>) -> Self {
        Self { bounds, generator }
    }
}

impl std::fmt::Debug for AssetItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetItem").field("bounds", &self.bounds).finish_non_exhaustive()
    }
}

/// Box in which user edits are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisableEditsItem {
    pub bounds: Aabb,
}

impl DisableEditsItem {
    pub fn new(bounds: Aabb) -> Self {
        Self { bounds }
    }
}

/// Opaque payload attached to a box.
#[derive(Clone, Debug, PartialEq)]
pub struct DataItem {
    pub bounds: Aabb,
    pub payload: Vec<u8>,
}

impl DataItem {
    pub fn new(bounds: Aabb, payload: Vec<u8>) -> Self {
        Self { bounds, payload }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::AssetItem {}
    impl Sealed for super::DisableEditsItem {}
    impl Sealed for super::DataItem {}
}

/// An item type the store knows how to hold and bake.
pub trait Item: sealed::Sealed + Send + Sync + Sized + 'static {
    fn bounds(&self) -> Aabb;

    #[doc(hidden)]
    fn collection(items: &ItemOverlay) -> &ItemCollection<Self>;

    #[doc(hidden)]
    fn bake(&self, data: &VoxelData);
}

impl Item for AssetItem {
    fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn collection(items: &ItemOverlay) -> &ItemCollection<Self> {
        &items.assets
    }

    fn bake(&self, data: &VoxelData) {
        for leaf in data.create_leaves_in(&self.bounds) {
            let Some(lock) = leaf.data() else {
                continue;
            };
            let leaf_bounds = leaf.bounds();
            let mut leaf_data = write_leaf(lock);
            paint_asset::<VoxelValue>(&mut leaf_data, leaf_bounds, self, &**data.generator());
            paint_asset::<VoxelMaterial>(&mut leaf_data, leaf_bounds, self, &**data.generator());
            drop(leaf_data);
            data.mark_dirty(leaf.id(), leaf_bounds);
        }
    }
}

impl Item for DisableEditsItem {
    fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn collection(items: &ItemOverlay) -> &ItemCollection<Self> {
        &items.disable_edits
    }

    fn bake(&self, data: &VoxelData) {
        for leaf in data.create_leaves_in(&self.bounds) {
            if let Some(lock) = leaf.data() {
                write_leaf(lock).add_protected(self.bounds.overlap(&leaf.bounds()));
            }
        }
    }
}

impl Item for DataItem {
    fn bounds(&self) -> Aabb {
        self.bounds
    }

    fn collection(items: &ItemOverlay) -> &ItemCollection<Self> {
        &items.data
    }

    fn bake(&self, _data: &VoxelData) {}
}

/// Copy the asset's output for channel `T` into the part of the leaf it
/// covers, skipping user-edited voxels.
fn paint_asset<T: VoxelChannel>(
    leaf: &mut LeafData,
    leaf_bounds: Aabb,
    asset: &AssetItem,
    base: &dyn WorldGenerator,
) {
    let local = asset.bounds.overlap(&leaf_bounds);
    if local.is_empty() {
        return;
    }
    let generator = &*asset.generator;
    leaf.paint_unedited::<T>(&local, leaf_bounds.min, base, |p| T::sample(generator, p, 0));
}

/// Rebuild channel `T` as base generator overlaid by `assets` in order, then
/// user edits. With neither assets nor edits the array is freed and reads
/// fall back to the generator.
fn fold_assets<T: VoxelChannel>(
    leaf: &mut LeafData,
    leaf_bounds: Aabb,
    assets: &[&Arc<AssetItem>],
    base: &dyn WorldGenerator,
) {
    if assets.is_empty() && !leaf.is_dirty::<T>() {
        leaf.destroy_channel::<T>();
        return;
    }
    if leaf.has_channel::<T>() {
        leaf.paint_unedited::<T>(&leaf_bounds, leaf_bounds.min, base, |p| T::sample(base, p, 0));
    }
    for asset in assets {
        paint_asset::<T>(leaf, leaf_bounds, asset, base);
    }
}

/// Ordered items of one type.
#[derive(Debug)]
pub struct ItemCollection<T> {
    items: RwLock<Vec<Arc<T>>>,
}

impl<T> Default for ItemCollection<T> {
    fn default() -> Self {
        Self { items: RwLock::new(Vec::new()) }
    }
}

impl<T: Item> ItemCollection<T> {
    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: Arc<T>) {
        self.write().push(item);
    }

    fn remove(&self, item: &Arc<T>) -> bool {
        let mut items = self.write();
        match items.iter().position(|i| Arc::ptr_eq(i, item)) {
            Some(index) => {
                items.remove(index);
                true
            }
            None => false,
        }
    }

    /// All items in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.read().clone()
    }

    /// Items whose bounds intersect `bounds`, in insertion order.
    pub fn overlapping(&self, bounds: &Aabb) -> Vec<Arc<T>> {
        self.read()
            .iter()
            .filter(|item| item.bounds().intersects(bounds))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.write().clear();
    }
}

/// Every item collection of a store.
#[derive(Debug, Default)]
pub struct ItemOverlay {
    assets: ItemCollection<AssetItem>,
    disable_edits: ItemCollection<DisableEditsItem>,
    data: ItemCollection<DataItem>,
}

impl ItemOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assets(&self) -> &ItemCollection<AssetItem> {
        &self.assets
    }

    pub fn disable_edits(&self) -> &ItemCollection<DisableEditsItem> {
        &self.disable_edits
    }

    pub fn data_items(&self) -> &ItemCollection<DataItem> {
        &self.data
    }

    /// Total number of items of all types.
    pub fn len(&self) -> usize {
        self.assets.len() + self.disable_edits.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.assets.clear();
        self.disable_edits.clear();
        self.data.clear();
    }
}

/// Weak reference to an added item, used to remove it.
#[derive(Debug)]
pub struct ItemHandle<T> {
    item: Weak<T>,
}

impl<T> Clone for ItemHandle<T> {
    fn clone(&self) -> Self {
        Self { item: Weak::clone(&self.item) }
    }
}

impl<T> ItemHandle<T> {
    /// The item, if it is still in the store.
    pub fn upgrade(&self) -> Option<Arc<T>> {
        self.item.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.item.strong_count() > 0
    }
}

impl VoxelData {
    pub(crate) fn create_leaves_in(&self, bounds: &Aabb) -> Vec<&Node> {
        let mut leaves = Vec::new();
        let bounds = bounds.overlap(&self.world_bounds());
        if !bounds.is_empty() {
            self.root().create_leaves_overlapping(&bounds, self.stats_sink(), &mut leaves);
        }
        leaves
    }

    pub fn items(&self) -> &ItemOverlay {
        &self.items
    }

    /// Add an item and bake it into the leaves it overlaps. The caller holds
    /// a read-write lock on the item bounds.
    pub fn add_item<T: Item>(&self, item: T) -> ItemHandle<T> {
        let bounds = item.bounds();
        debug_assert!(
            self.locks().is_locked(LockKind::ReadWrite, &bounds),
            "add_item without a read-write lock on {}",
            bounds
        );
        let item = Arc::new(item);
        T::collection(&self.items).push(Arc::clone(&item));
        item.bake(self);
        log::debug!("Added {} over {}", std::any::type_name::<T>(), bounds);
        ItemHandle { item: Arc::downgrade(&item) }
    }

    /// Remove an item and re-derive the leaves it overlapped.
    pub fn remove_item<T: Item>(&self, handle: &ItemHandle<T>) -> Result<()> {
        let item = handle.upgrade().ok_or(Error::ItemNotFound)?;
        let bounds = item.bounds();
        debug_assert!(
            self.locks().is_locked(LockKind::ReadWrite, &bounds),
            "remove_item without a read-write lock on {}",
            bounds
        );
        if !T::collection(&self.items).remove(&item) {
            return Err(Error::ItemNotFound);
        }
        drop(item);
        self.rederive(&bounds);
        log::debug!("Removed {} over {}", std::any::type_name::<T>(), bounds);
        Ok(())
    }

    /// Data items intersecting `bounds`, in insertion order.
    pub fn data_items_overlapping(&self, bounds: &Aabb) -> Vec<Arc<DataItem>> {
        self.items.data.overlapping(bounds)
    }

    fn rederive(&self, bounds: &Aabb) {
        let mut leaves = Vec::new();
        self.root().leaves_overlapping(bounds, &mut leaves);
        self.refold_leaves(&leaves);
    }

    /// Rebuild the protected boxes and built-in channels of `leaves` from the
    /// base generator, the current items and the leaves' user edits.
    pub(crate) fn refold_leaves(&self, leaves: &[&Node]) {
        let assets = self.items.assets.snapshot();
        let protection = self.items.disable_edits.snapshot();
        let base = &**self.generator();

        leaves.par_iter().for_each(|leaf| {
            let Some(lock) = leaf.data() else {
                return;
            };
            let leaf_bounds = leaf.bounds();
            let overlapping: Vec<&Arc<AssetItem>> = assets
                .iter()
                .filter(|a| a.bounds.intersects(&leaf_bounds))
                .collect();

            let mut data = write_leaf(lock);
            data.set_protected(
                protection
                    .iter()
                    .filter(|p| p.bounds.intersects(&leaf_bounds))
                    .map(|p| p.bounds.overlap(&leaf_bounds))
                    .collect(),
            );
            fold_assets::<VoxelValue>(&mut data, leaf_bounds, &overlapping, base);
            fold_assets::<VoxelMaterial>(&mut data, leaf_bounds, &overlapping, base);
            drop(data);
            self.mark_dirty(leaf.id(), leaf_bounds);
        });
    }

    /// Bake every item again, in insertion order per type.
    pub(crate) fn rebake_items(&self) {
        for asset in self.items.assets.snapshot() {
            asset.bake(self);
        }
        for protection in self.items.disable_edits.snapshot() {
            protection.bake(self);
        }
    }
}
