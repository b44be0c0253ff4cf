// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The long-lived heap, grounded on
//! `Allocator.cpp`'s `PersistentAllocator`:
//! two ordered free-range indices (by address, for coalescing; by size, for
//! servicing requests), a region list recording every VM region ever
//! acquired, and a magazine that supplies the free-range trees' own node
//! storage without re-entering this allocator (see [`crate::magazine`]).
//!
//! Departures from the source, each chosen because the `NodeSource` trait
//! seam already dissolves the reentrancy hazard the source's design exists
//! to work around:
//!   - No `deallocationChain`/20-slot dealloc batching: the source parks
//!     frees that happen mid-tree-mutation on an intrusive chain because its
//!     magazine's own `deallocate_buffer` calls back into this allocator.
//!     This crate's magazine (`MagazineNodeSource`) never calls back into
//!     `PersistentAllocator` at all, so there is nothing to park.
//!   - One shared `Mutex<Inner>` instead of three independently-locked
//!     B+Trees sharing one magazine: since every public method already takes
//!     the `MemoryManager` lock for its full duration, a second
//!     standard-library `Mutex` around the mutable state gives safe interior
//!     mutability behind `&self` (so `Unique`/`Shared` can hold a plain
//!     `Arc<PersistentAllocator>`) without `unsafe`; it is never contended
//!     because the outer lock already serializes every caller.
//!   - Free-range lookups materialize the relevant tree via `to_vec()` and
//!     binary-search the result, rather than walking a live cursor from
//!     `lower_bound`. `atlas-collections::BTree` has no cursor/iterator type
//!     (see its module docs: "any mutation may relocate nodes"); for the
//!     region counts this allocator deals with, a full copy per call is
//!     an acceptable simplification over adding cursor support used by only
//!     one caller.

use std::sync::{Mutex, PoisonError};

use atlas_core::Address;
use log::{debug, trace};

use crate::magazine::MagazineNodeSource;
use crate::memory_manager::MemoryManager;
use crate::metadata::{good_size, AllocationMetadata, GRANULE};
use crate::vm::{self, Buffer};

type Tree<T> = atlas_collections::btree::BTree<T, usize, MagazineNodeSource<atlas_collections::btree::Node<T, usize>>>;

/// Not derived from a published constant
/// (`PERSISTENT_ALLOCATOR_DEFAULT_POOL_SIZE` is a build-time macro whose
/// value isn't available); chosen as a round size that comfortably holds this
/// allocator's own bootstrap state plus a handful of real allocations before
/// a second VM region is needed.
const DEFAULT_POOL_SIZE: usize = 4 * 1024 * 1024;

/// Target number of spare magazine slots kept ready per tree between
/// top-level operations. The source derives this from live tree depths
/// (`2*(depth_a+depth_b+depth_c)+3`) because running out there is a
/// hard failure with no recovery path; this crate's magazine reports
/// exhaustion as an ordinary `Err` instead (see `NodeSource::acquire`'s
/// contract), so a fixed conservative target is sufficient.
const MAGAZINE_TARGET: usize = 8;

/// `Buffer` ordered by `(size, address)` — the free-by-size index's key,
/// mirroring the source's `RegionSizeCompare`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BySize(Buffer);

impl PartialOrd for BySize {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySize {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.size, self.0.address).cmp(&(other.0.size, other.0.address))
    }
}

struct Inner {
    region_list: Tree<Buffer>,
    free_by_address: Tree<Buffer>,
    free_by_size: Tree<BySize>,
    allocated_bytes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            region_list: atlas_collections::btree::BTree::new(MagazineNodeSource::new()),
            free_by_address: atlas_collections::btree::BTree::new(MagazineNodeSource::new()),
            free_by_size: atlas_collections::btree::BTree::new(MagazineNodeSource::new()),
            allocated_bytes: 0,
        }
    }
}

/// The long-lived allocator backing `Unique`/`Shared` and every B+Tree in
/// the workspace that is not itself part of this allocator's own indices.
pub struct PersistentAllocator {
    memory_manager: MemoryManager,
    inner: Mutex<Inner>,
}

impl PersistentAllocator {
    /// Bootstraps a fresh allocator from one freshly `vm_allocate`d region.
    #[must_use]
    pub fn new() -> Self {
        let region = vm::vm_allocate_bytes(DEFAULT_POOL_SIZE);
        let mut inner = Inner::new();
        inner.region_list.insert(region);
        inner.free_by_size.insert(BySize(region));
        inner.free_by_address.insert(region);
        let allocator = Self { memory_manager: MemoryManager::new(), inner: Mutex::new(inner) };
        {
            let mut guard = allocator.inner.lock().unwrap_or_else(PoisonError::into_inner);
            allocator.reload_magazine(&mut guard);
        }
        allocator
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A 49-bit-safe back-reference to this allocator instance, stored in
    /// every header this allocator writes. Not consulted for routing frees —
    /// `Unique`/`Shared` carry their owning `Arc<PersistentAllocator>`
    /// directly (see `crate::pointer`'s module docs) — but kept so the
    /// metadata layout and its tests stay faithful to the data model.
    fn allocator_ref(&self) -> u64 {
        (std::ptr::from_ref(self) as u64) >> 3
    }

    /// Finds and reserves a free range of at least `nbytes + prefix` bytes
    /// with `nbytes` bytes aligned to `alignment` starting `prefix` bytes in.
    /// Acquires a new VM region and retries if no existing free range fits.
    #[must_use]
    pub fn allocate_buffer(&self, nbytes: usize, alignment: usize, prefix: usize) -> Buffer {
        let _guard = self.memory_manager.lock_guard();
        loop {
            let mut inner = self.lock_inner();
            debug_assert_eq!(inner.free_by_size.len(), inner.free_by_address.len());
            let candidates = inner.free_by_size.to_vec();
            let start = candidates.partition_point(|c| c.0.size < nbytes + prefix);
            let found = candidates[start..].iter().find_map(|c| c.0.find_space(nbytes, alignment, prefix).map(|space| (c.0, space)));
            if let Some((existing, space)) = found {
                self.reserve_range(&mut inner, existing, space);
                inner.allocated_bytes += space.size;
                self.reload_magazine(&mut inner);
                trace!("atlas-alloc: allocate_buffer({nbytes}, {alignment}, {prefix}) -> {space:?}");
                return space;
            }
            drop(inner);
            let region_size = if nbytes + alignment + GRANULE < DEFAULT_POOL_SIZE { DEFAULT_POOL_SIZE } else { nbytes + alignment + GRANULE };
            let new_region = vm::vm_allocate_bytes(region_size);
            let mut inner = self.lock_inner();
            inner.region_list.insert(new_region);
            inner.free_by_size.insert(BySize(new_region));
            inner.free_by_address.insert(new_region);
            debug!("atlas-alloc: acquired new region {new_region:?} for a {nbytes}-byte request");
            self.reload_magazine(&mut inner);
        }
    }

    /// Splits `existing` around `allocated`, re-inserting whatever remains
    /// before and/or after it as free space.
    fn reserve_range(&self, inner: &mut Inner, existing: Buffer, allocated: Buffer) {
        inner.free_by_size.erase(&BySize(existing));
        inner.free_by_address.erase(&existing);
        let alloc_start = allocated.address.as_u64();
        let alloc_end = allocated.end().as_u64();
        if existing.address.as_u64() < alloc_start {
            let prolog = Buffer::new(existing.address, (alloc_start - existing.address.as_u64()) as usize);
            inner.free_by_size.insert(BySize(prolog));
            inner.free_by_address.insert(prolog);
        }
        if existing.end().as_u64() > alloc_end {
            let epilog = Buffer::new(Address::new(alloc_end), (existing.end().as_u64() - alloc_end) as usize);
            inner.free_by_size.insert(BySize(epilog));
            inner.free_by_address.insert(epilog);
        }
    }

    /// Returns `buffer` to the free indices, coalescing with an abutting
    /// predecessor and/or successor, and releases the enclosing region to
    /// the VM layer if the coalesced block spans it entirely.
    pub fn deallocate_buffer(&self, buffer: Buffer) {
        let _guard = self.memory_manager.lock_guard();
        let mut inner = self.lock_inner();
        self.add_to_free_block_trees(&mut inner, buffer);
        inner.allocated_bytes = inner.allocated_bytes.saturating_sub(buffer.size);
        self.reload_magazine(&mut inner);
        trace!("atlas-alloc: deallocate_buffer({buffer:?})");
    }

    fn add_to_free_block_trees(&self, inner: &mut Inner, mut buffer: Buffer) {
        let addresses = inner.free_by_address.to_vec();
        let pos = addresses.partition_point(|b| b.address < buffer.address);
        if let Some(&next) = addresses.get(pos) {
            if buffer.succeeds(&next) {
                buffer = Buffer::new(buffer.address, buffer.size + next.size);
                inner.free_by_size.erase(&BySize(next));
                inner.free_by_address.erase(&next);
            }
        }
        if pos > 0 {
            let prev = addresses[pos - 1];
            if prev.succeeds(&buffer) {
                buffer = Buffer::new(prev.address, prev.size + buffer.size);
                inner.free_by_size.erase(&BySize(prev));
                inner.free_by_address.erase(&prev);
            }
        }
        inner.free_by_size.insert(BySize(buffer));
        inner.free_by_address.insert(buffer);

        if buffer.size < DEFAULT_POOL_SIZE {
            return;
        }
        // Guard pages between VM regions guarantee at most one region can
        // ever match a single coalesced free buffer exactly.
        let regions = inner.region_list.to_vec();
        if let Some(&region) = regions.iter().find(|r| **r == buffer) {
            vm::vm_deallocate_bytes(region.address, region.size);
            inner.free_by_size.erase(&BySize(buffer));
            inner.free_by_address.erase(&buffer);
            inner.region_list.erase(&region);
            debug!("atlas-alloc: returned empty region {region:?} to the VM layer");
        }
    }

    /// Tops up each tree's magazine to `MAGAZINE_TARGET` spare slots. Must
    /// only run between top-level operations — see `crate::magazine`.
    fn reload_magazine(&self, inner: &mut Inner) {
        let needed = |available: usize| MAGAZINE_TARGET.saturating_sub(available);
        let n = needed(inner.region_list.node_source_mut().available());
        if n > 0 {
            inner.region_list.node_source_mut().refill(n);
        }
        let n = needed(inner.free_by_address.node_source_mut().available());
        if n > 0 {
            inner.free_by_address.node_source_mut().refill(n);
        }
        let n = needed(inner.free_by_size.node_source_mut().available());
        if n > 0 {
            inner.free_by_size.node_source_mut().refill(n);
        }
    }

    /// `true` iff some region owned by this allocator contains `[p, p+n)`.
    #[must_use]
    pub fn owned(&self, p: *const u8, nbytes: usize) -> bool {
        let inner = self.lock_inner();
        let probe = Buffer::new(Address::new(p as u64), nbytes);
        inner.region_list.to_vec().iter().any(|r| r.contains(&probe))
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.lock_inner().allocated_bytes
    }

    #[must_use]
    pub fn vm_allocated_bytes(&self) -> usize {
        self.lock_inner().region_list.to_vec().iter().map(|r| r.size).sum()
    }

    /// Flips every region this allocator owns between read-only and
    /// read-write. Best-effort.
    pub fn write_protect(&self, protect: bool) {
        let regions = self.lock_inner().region_list.to_vec();
        self.memory_manager.write_protect(&regions, protect);
    }

    /// Rounds and aligns `size`, reserves a granule-sized prefix, and
    /// placement-constructs an [`AllocationMetadata`] header in it.
    ///
    /// # Panics
    /// Panics if `size` is large enough that `good_size` cannot represent it
    /// (practically unreachable — the coarsest granule covers `2^48` bytes).
    #[must_use]
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
        let target_alignment = alignment.max(GRANULE);
        // Alignment is satisfied positionally by `allocate_buffer`/`find_space`
        // (the aligned region is searched for within a free block, after the
        // `prefix` reservation); the payload size itself must not be inflated
        // to a multiple of the alignment, or the recorded `good_size` stops
        // matching §8 scenario 1 (`good_size(100) == 112`, not 128).
        let target_size = good_size(size.max(GRANULE));
        let buffer = self.allocate_buffer(target_size, target_alignment, GRANULE);
        let allocator_ref = self.allocator_ref();
        // SAFETY: `buffer` is a fresh, uniquely-owned allocation at least
        // `GRANULE + target_size` bytes long; nothing else observes this
        // memory until this call returns.
        unsafe {
            buffer.address.as_mut_ptr::<AllocationMetadata>().write(AllocationMetadata::new(allocator_ref, buffer.size - GRANULE));
            buffer.address.offset(GRANULE as u64).as_mut_ptr::<u8>()
        }
    }

    /// Recovers the header immediately preceding `ptr` and returns its
    /// buffer (header included) to this allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Self::aligned_alloc`] on this same
    /// allocator and not already freed.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let header_addr = Address::new(ptr as u64).offset_signed(-(GRANULE as i64));
        // SAFETY: caller guarantees `ptr` was returned by `aligned_alloc`,
        // which always writes a header at `ptr - GRANULE`.
        let size = unsafe { (*header_addr.as_ptr::<AllocationMetadata>()).size() };
        self.deallocate_buffer(Buffer::new(header_addr, size + GRANULE));
    }

    /// Releases every region back to the VM layer.
    ///
    /// # Panics
    /// Panics if any allocation is still outstanding, matching the source's
    /// `contract(_allocatedBytes == 0)`.
    pub fn destroy(&self) {
        let inner = self.lock_inner();
        assert_eq!(inner.allocated_bytes, 0, "atlas-alloc: destroy() called with outstanding allocations");
        for region in inner.region_list.to_vec() {
            vm::vm_deallocate_bytes(region.address, region.size);
        }
    }
}

impl Default for PersistentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PersistentAllocator;
    use crate::metadata::good_size;

    #[test]
    fn allocate_then_free_round_trips() {
        let allocator = PersistentAllocator::new();
        let ptr = allocator.aligned_alloc(32, 100);
        assert!(!ptr.is_null());
        assert_eq!(allocator.allocated_bytes(), good_size(100) + 16);
        // SAFETY: ptr was just returned by aligned_alloc on this allocator.
        unsafe { allocator.free(ptr) };
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn owned_reports_true_only_within_a_region() {
        let allocator = PersistentAllocator::new();
        let ptr = allocator.aligned_alloc(16, 64);
        assert!(allocator.owned(ptr.cast(), 1));
        assert!(!allocator.owned(std::ptr::without_provenance(0x1), 1));
        // SAFETY: ptr was just returned by aligned_alloc on this allocator.
        unsafe { allocator.free(ptr) };
    }

    #[test]
    fn many_allocations_coalesce_back_to_one_free_range() {
        let allocator = PersistentAllocator::new();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            ptrs.push(allocator.aligned_alloc(16, 48));
        }
        for ptr in ptrs {
            // SAFETY: every ptr was returned by aligned_alloc above.
            unsafe { allocator.free(ptr) };
        }
        assert_eq!(allocator.allocated_bytes(), 0);
    }
}
