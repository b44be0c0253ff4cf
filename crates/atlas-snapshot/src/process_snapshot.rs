// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`ProcessSnapshot`]: the set of loaded images plus at most one shared
//! cache plus a membership bitmap, grounded on
//! `ProcessAtlas.h`'s `ProcessSnapshot`.
//!
//! Departure from the source: the source stores images in an
//! `OrderedSet<UniquePtr<Image>>` — a B+Tree of owning pointers. This crate
//! keeps a plain `Vec<Image>` maintained in sorted order by binary-search
//! insertion instead, for two reasons: `atlas_collections::OrderedSet`
//! requires `T: Clone` (so its B+Tree can return owned copies from
//! `to_vec()`), which `Image` cannot satisfy without duplicating file
//! handles and mapper state; and the own text describes
//! `remove_image_at_address` as "linear scan (small N)", i.e. the source
//! itself does not expect this collection to be large enough to need a
//! tree's asymptotics.

use std::path::Path;
use std::sync::Arc;

use atlas_collections::Bitmap;
use atlas_core::Address;
use atlas_fs::FileManager;
use atlas_image::mapper::Mapper;
use atlas_image::{CacheImage, Image, SharedCache};

/// One entry yielded by [`ProcessSnapshot::for_each_image`]: either a
/// standalone image or a cache-resident image identified only by its
/// [`CacheImage`] metadata (no `Image`/`Mapper` is constructed for cache
/// images unless the caller asks for one directly via the cache).
pub enum SnapshotImage<'a> {
    Standalone(&'a Image),
    InSharedCache(&'a CacheImage),
}

pub struct ProcessSnapshot {
    images: Vec<Image>,
    shared_cache: Option<SharedCache>,
    bitmap: Bitmap,
    platform: u64,
    initial_image_count: u64,
    dyld_state: u64,
    identity_mapper: Arc<Mapper>,
    valid: bool,
}

impl Default for ProcessSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            images: Vec::new(),
            shared_cache: None,
            bitmap: Bitmap::new(0),
            platform: 0,
            initial_image_count: 0,
            dyld_state: 0,
            identity_mapper: Arc::new(Mapper::identity()),
            valid: true,
        }
    }

    /// An inert snapshot whose construction failed: every accessor behaves
    /// as if empty, matching the "a snapshot whose construction failed is
    /// functional but inert" contract.
    #[must_use]
    pub fn invalid() -> Self {
        let mut snapshot = Self::new();
        snapshot.valid = false;
        snapshot
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn identity_mapper(&self) -> &Arc<Mapper> {
        &self.identity_mapper
    }

    #[must_use]
    pub fn platform(&self) -> u64 {
        self.platform
    }

    pub fn set_platform(&mut self, platform: u64) {
        self.platform = platform;
    }

    #[must_use]
    pub fn initial_image_count(&self) -> u64 {
        self.initial_image_count
    }

    pub fn set_initial_image_count(&mut self, count: u64) {
        self.initial_image_count = count;
    }

    #[must_use]
    pub fn dyld_state(&self) -> u64 {
        self.dyld_state
    }

    pub fn set_dyld_state(&mut self, state: u64) {
        self.dyld_state = state;
    }

    #[must_use]
    pub fn shared_cache(&self) -> Option<&SharedCache> {
        self.shared_cache.as_ref()
    }

    #[must_use]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    /// Inserts `image`, keeping the backing vector sorted by rebased
    /// address (`add_image`).
    pub fn add_image(&mut self, image: Image) {
        let position = self.images.partition_point(|existing| existing.rebased_address() <= image.rebased_address());
        self.images.insert(position, image);
    }

    /// Installs `cache` and allocates a bitmap sized to its image count
    /// (`add_shared_cache`).
    pub fn add_shared_cache(&mut self, cache: SharedCache) {
        self.bitmap = Bitmap::new(cache.image_count());
        self.shared_cache = Some(cache);
    }

    /// Installs a cache reconstructed from a compact-info buffer together
    /// with its already-decoded membership bitmap, bypassing
    /// `add_shared_cache`'s fresh-empty-bitmap allocation — used only by
    /// [`crate::serializer::deserialize`], which decodes the bitmap's bits
    /// directly off the wire and would otherwise have them clobbered.
    pub(crate) fn install_shared_cache_with_bitmap(&mut self, cache: SharedCache, bitmap: Bitmap) {
        self.shared_cache = Some(cache);
        self.bitmap = bitmap;
    }

    /// Locates `mh`'s unslid address within the installed cache and sets
    /// its membership bit. Returns `false` if there is no cache or `mh`
    /// isn't one of its images (`add_shared_cache_image`).
    pub fn add_shared_cache_image(&mut self, mh: u64) -> bool {
        let Some(cache) = &self.shared_cache else { return false };
        let Some(index) = cache.index_for_unslid_address(mh) else { return false };
        self.bitmap.set_bit(index);
        true
    }

    /// Removes the standalone image at `address`, if any, by linear scan
    /// (`remove_image_at_address`).
    pub fn remove_image_at_address(&mut self, address: Address) -> bool {
        let Some(position) = self.images.iter().position(|image| image.rebased_address() == address) else { return false };
        self.images.remove(position);
        true
    }

    /// Iterates every image in address order, flushing cache-resident
    /// images (in bitmap order) just before the first standalone image at
    /// or above the cache's rebased address (`for_each_image`).
    pub fn for_each_image(&self, mut f: impl FnMut(SnapshotImage<'_>)) {
        let cache_address = self.shared_cache.as_ref().map(SharedCache::rebased_address);
        let mut flushed_cache = cache_address.is_none();
        for image in &self.images {
            if !flushed_cache {
                if let Some(cache_address) = cache_address {
                    if image.rebased_address() >= cache_address {
                        self.flush_cache_images(&mut f);
                        flushed_cache = true;
                    }
                }
            }
            f(SnapshotImage::Standalone(image));
        }
        if !flushed_cache {
            self.flush_cache_images(&mut f);
        }
    }

    fn flush_cache_images(&self, f: &mut impl FnMut(SnapshotImage<'_>)) {
        let Some(cache) = &self.shared_cache else { return };
        cache.for_each_image(|index, cache_image| {
            if self.bitmap.check_bit(index) {
                f(SnapshotImage::InSharedCache(cache_image));
            }
        });
    }

    /// Reports every image present in `self` but absent from `other`: a
    /// simultaneous merge of the two address-ordered standalone sequences,
    /// plus a bitmap difference over cache membership.
    pub fn for_each_image_not_in(&self, other: &ProcessSnapshot, mut f: impl FnMut(SnapshotImage<'_>)) {
        let mut left = self.images.iter().peekable();
        let mut right = other.images.iter().peekable();
        while let Some(left_image) = left.peek() {
            match right.peek() {
                Some(right_image) if right_image.rebased_address() < left_image.rebased_address() => {
                    right.next();
                }
                Some(right_image) if right_image.rebased_address() == left_image.rebased_address() => {
                    left.next();
                    right.next();
                }
                _ => {
                    f(SnapshotImage::Standalone(left.next().expect("peeked")));
                }
            }
        }
        if let (Some(cache), Some(other_cache)) = (&self.shared_cache, &other.shared_cache) {
            if cache.uuid() == other_cache.uuid() {
                cache.for_each_image(|index, cache_image| {
                    let present_here = self.bitmap.check_bit(index);
                    let present_there = index < other.bitmap.size() && other.bitmap.check_bit(index);
                    if present_here && !present_there {
                        f(SnapshotImage::InSharedCache(cache_image));
                    }
                });
            }
        } else if self.shared_cache.is_some() && other.shared_cache.is_none() {
            self.flush_cache_images(&mut f);
        }
    }

    /// Walks a fixed set of known cache directories under `system_root`
    /// and returns the first installed shared cache found, if any — a thin
    /// convenience over [`SharedCache::for_each_installed_cache_with_system_path`]
    /// for callers (like `atlas-process`'s synthesis path) that just need
    /// "the" system cache.
    pub fn find_installed_shared_cache(system_root: &Path, file_manager: &Arc<FileManager>) -> Option<SharedCache> {
        let mut found = None;
        let _ = SharedCache::for_each_installed_cache_with_system_path(system_root, file_manager, |cache| {
            if found.is_none() {
                found = Some(cache);
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_fs::FileManager;

    fn standalone(manager: &Arc<FileManager>, path: &str, addr: u64) -> Image {
        let file = manager.file_record_for_path(path);
        Image::standalone(file, Arc::new(Mapper::identity()), Address::new(addr))
    }

    #[test]
    fn add_image_keeps_images_sorted_by_address() {
        let manager = Arc::new(FileManager::new());
        let mut snapshot = ProcessSnapshot::new();
        snapshot.add_image(standalone(&manager, "/b", 0x2000));
        snapshot.add_image(standalone(&manager, "/a", 0x1000));
        let addresses: Vec<u64> = snapshot.images().map(|i| i.rebased_address().as_u64()).collect();
        assert_eq!(addresses, vec![0x1000, 0x2000]);
    }

    #[test]
    fn remove_image_at_address_removes_exactly_one() {
        let manager = Arc::new(FileManager::new());
        let mut snapshot = ProcessSnapshot::new();
        snapshot.add_image(standalone(&manager, "/a", 0x1000));
        snapshot.add_image(standalone(&manager, "/b", 0x2000));
        assert!(snapshot.remove_image_at_address(Address::new(0x1000)));
        assert!(!snapshot.remove_image_at_address(Address::new(0x1000)));
        assert_eq!(snapshot.image_count(), 1);
    }

    #[test]
    fn for_each_image_not_in_reports_the_symmetric_difference() {
        let manager = Arc::new(FileManager::new());
        let mut a = ProcessSnapshot::new();
        a.add_image(standalone(&manager, "/shared", 0x1000));
        a.add_image(standalone(&manager, "/only_a", 0x2000));
        let mut b = ProcessSnapshot::new();
        b.add_image(standalone(&manager, "/shared", 0x1000));
        b.add_image(standalone(&manager, "/only_b", 0x3000));

        let mut a_not_in_b = Vec::new();
        a.for_each_image_not_in(&b, |img| {
            if let SnapshotImage::Standalone(image) = img {
                a_not_in_b.push(image.rebased_address().as_u64());
            }
        });
        assert_eq!(a_not_in_b, vec![0x2000]);

        let mut b_not_in_a = Vec::new();
        b.for_each_image_not_in(&a, |img| {
            if let SnapshotImage::Standalone(image) = img {
                b_not_in_a.push(image.rebased_address().as_u64());
            }
        });
        assert_eq!(b_not_in_a, vec![0x3000]);
    }
}
