// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Per-allocation header, inlined immediately before every object handed out
//! by [`crate::PersistentAllocator`] and [`crate::EphemeralAllocator`].
//!
//! Grounded on `Allocator.h`'s
//! `AllocationMetadata` bitfield struct: a packed `allocator` backreference,
//! a granule-counted `size`, a 2-bit `size_class` selecting which of four
//! granule granularities that count is in, a 2-bit ownership `type` used to
//! distinguish a bare allocation from one owned by a [`crate::Unique`] or
//! [`crate::Shared`], and two refcounts. `goodSize`/the four granule shifts
//! are not read directly off `Allocator.cpp` (source not available) —
//! this module's `good_size` is an inference from the
//! header's `granules[] = {4, 15, 26, 37}` array, hand-verified against the
//! one literal `good_size(100) == 112` scenario this repo's behavior must
//! match. Treat it as an approximation of the real rounding table, not a
//! verified port.

use std::sync::atomic::{AtomicU32, Ordering};

/// `granules[n]` is the log2 of the granule size for size class `n`.
pub const GRANULE_SHIFTS: [u32; 4] = [4, 15, 26, 37];

/// Size in bytes of one granule: the minimum alignment and size unit for
/// every managed allocation, and the width of the prefix header itself.
pub const GRANULE: usize = 1 << GRANULE_SHIFTS[0];

/// Bits available to the granule count regardless of size class.
const SIZE_BITS: u32 = 11;
const MAX_GRANULE_COUNT: u64 = (1 << SIZE_BITS) - 1;

/// Rounds `requested` up to the smallest representable allocation size.
///
/// Walks the granule classes from finest to coarsest and returns the first
/// one whose rounded-up granule count still fits in an 11-bit field.
#[must_use]
pub fn good_size(requested: usize) -> usize {
    let requested = requested.max(1) as u64;
    for &shift in &GRANULE_SHIFTS {
        let granule = 1u64 << shift;
        let count = requested.div_ceil(granule);
        if count <= MAX_GRANULE_COUNT {
            return (count * granule) as usize;
        }
    }
    // Larger than any representable size class; round to the coarsest granule.
    let granule = 1u64 << GRANULE_SHIFTS[GRANULE_SHIFTS.len() - 1];
    (requested.div_ceil(granule) * granule) as usize
}

/// Returns `(size_class, granule_count)` for an already-`good_size`d value.
fn classify(size: usize) -> (u8, u64) {
    let size = size as u64;
    for (class, &shift) in GRANULE_SHIFTS.iter().enumerate() {
        let granule = 1u64 << shift;
        if size % granule == 0 {
            let count = size / granule;
            if count <= MAX_GRANULE_COUNT {
                return (class as u8, count);
            }
        }
    }
    let last = GRANULE_SHIFTS.len() - 1;
    let granule = 1u64 << GRANULE_SHIFTS[last];
    (last as u8, size / granule)
}

/// The ownership discipline currently applied to an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OwnershipKind {
    /// A bare pointer with no smart-pointer ownership yet attached.
    Normal = 0,
    /// Owned by exactly one [`crate::Unique`].
    Unique = 1,
    /// Owned by one or more [`crate::Shared`], refcounted.
    Shared = 2,
}

impl OwnershipKind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Normal,
            1 => Self::Unique,
            _ => Self::Shared,
        }
    }
}

/// The 16-byte header immediately preceding an allocator-owned object.
///
/// Packs `allocator` (an opaque 49-bit backreference, here an index into
/// the owning allocator's own bookkeeping rather than a raw pointer, since
/// nothing in this crate needs to recover a `&dyn Allocator` from a bit
/// pattern) together with the granule-counted size, size class, and
/// ownership kind into one `u64`, followed by two plain `AtomicU32`
/// refcounts — mirroring the source's layout so the struct still fits in
/// one 16-byte granule ([`crate::metadata`]'s own `GRANULE_SHIFTS[0]`).
#[repr(C)]
pub struct AllocationMetadata {
    packed: u64,
    strong_refs: AtomicU32,
    weak_refs: AtomicU32,
}

const ALLOCATOR_BITS: u32 = 49;
const ALLOCATOR_MASK: u64 = (1 << ALLOCATOR_BITS) - 1;
const SIZE_SHIFT: u32 = ALLOCATOR_BITS;
const SIZE_MASK: u64 = MAX_GRANULE_COUNT;
const CLASS_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;
const CLASS_MASK: u64 = 0b11;
const TYPE_SHIFT: u32 = CLASS_SHIFT + 2;
const TYPE_MASK: u64 = 0b11;

impl AllocationMetadata {
    /// Builds a fresh header for an allocation of `size` bytes (already
    /// rounded through [`good_size`]) owned by `allocator_ref`.
    #[must_use]
    pub fn new(allocator_ref: u64, size: usize) -> Self {
        let (class, count) = classify(size);
        let mut packed = allocator_ref & ALLOCATOR_MASK;
        packed |= count << SIZE_SHIFT;
        packed |= u64::from(class) << CLASS_SHIFT;
        Self { packed, strong_refs: AtomicU32::new(0), weak_refs: AtomicU32::new(0) }
    }

    #[must_use]
    pub const fn allocator_ref(&self) -> u64 {
        self.packed & ALLOCATOR_MASK
    }

    /// The allocation's size in bytes, reconstructed from its granule count
    /// and size class.
    #[must_use]
    pub fn size(&self) -> usize {
        let count = (self.packed >> SIZE_SHIFT) & SIZE_MASK;
        let class = ((self.packed >> CLASS_SHIFT) & CLASS_MASK) as usize;
        (count << GRANULE_SHIFTS[class]) as usize
    }

    #[must_use]
    pub fn kind(&self) -> OwnershipKind {
        OwnershipKind::from_bits(((self.packed >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    pub fn set_kind(&mut self, kind: OwnershipKind) {
        self.packed &= !(TYPE_MASK << TYPE_SHIFT);
        self.packed |= (kind as u64) << TYPE_SHIFT;
    }

    /// Bumps the strong refcount. Relaxed: a new reference is only ever
    /// created from one that's already alive, so no prior write needs to be
    /// visible yet.
    pub fn increment_ref_count(&self) {
        self.strong_refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Current strong count. Acquire so a caller inspecting this after
    /// observing some other clone's release sees a consistent count.
    #[must_use]
    pub fn strong_count(&self) -> u32 {
        self.strong_refs.load(Ordering::Acquire)
    }

    /// Drops the strong refcount, returning `true` if this was the last
    /// reference. Release on the decrement so every write through the
    /// pointer happens-before the free; acquire on the observing side is
    /// unnecessary here because only the thread that observes zero frees.
    #[must_use]
    pub fn decrement_ref_count(&self) -> bool {
        self.strong_refs.fetch_sub(1, Ordering::Release) == 1
    }

    pub fn increment_weak_ref_count(&self) {
        self.weak_refs.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn decrement_weak_ref_count(&self) -> bool {
        self.weak_refs.fetch_sub(1, Ordering::Release) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::{good_size, AllocationMetadata, OwnershipKind};

    #[test]
    fn good_size_rounds_up_within_the_finest_granule() {
        assert_eq!(good_size(100), 112);
    }

    #[test]
    fn good_size_is_idempotent() {
        for n in [1, 16, 17, 100, 4096, 65536] {
            let once = good_size(n);
            assert_eq!(good_size(once), once);
        }
    }

    #[test]
    fn metadata_round_trips_size_and_allocator_ref() {
        let size = good_size(4096);
        let meta = AllocationMetadata::new(0x1234, size);
        assert_eq!(meta.allocator_ref(), 0x1234);
        assert_eq!(meta.size(), size);
        assert_eq!(meta.kind(), OwnershipKind::Normal);
    }

    #[test]
    fn set_kind_updates_only_the_type_bits() {
        let size = good_size(64);
        let mut meta = AllocationMetadata::new(7, size);
        meta.set_kind(OwnershipKind::Shared);
        assert_eq!(meta.kind(), OwnershipKind::Shared);
        assert_eq!(meta.allocator_ref(), 7);
        assert_eq!(meta.size(), size);
    }

    #[test]
    fn ref_count_decrements_to_zero_exactly_once() {
        let meta = AllocationMetadata::new(0, good_size(8));
        meta.increment_ref_count();
        meta.increment_ref_count();
        assert!(!meta.decrement_ref_count());
        assert!(meta.decrement_ref_count());
    }
}
