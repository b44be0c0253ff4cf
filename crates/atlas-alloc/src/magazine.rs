// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`MagazineNodeSource`]: the reentrancy-breaking node store for
//! [`crate::PersistentAllocator`]'s own free-range trees.
//!
//! The source's `PersistentAllocator` has a dependency cycle: its two free-
//! range B+Trees draw node storage from the very allocator whose free space
//! they index. It breaks the cycle with a 4-slot `MagazineAllocator` of
//! pre-reserved 256-byte blocks, refilled only outside any tree mutation
//! (`PersistentAllocator::reloadMagazine`, called at the end of
//! `allocate_buffer`/`deallocate_buffer`, never from within one).
//!
//! `atlas-core::NodeSource` already relocates that cycle to a trait seam:
//! `atlas-collections::BTree` never calls an allocator itself, so unlike the
//! source this type's `acquire`/`release` never re-enter anything that could
//! grow its own backing storage. The only operation that can allocate new
//! slots is [`MagazineNodeSource::refill`], and the caller (`PersistentAllocator`)
//! is responsible for calling it only between top-level operations, exactly
//! as the source calls `reloadMagazine` only between them.

use atlas_core::NodeSource;

/// A slab of node slots, handed out and reclaimed without ever growing the
/// backing `Vec` during a tree mutation.
///
/// `refill` is the sole growth point; everything else is pure bookkeeping
/// over already-reserved slots.
pub struct MagazineNodeSource<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Default for MagazineNodeSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MagazineNodeSource<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Grows the magazine by `count` empty slots, ready to be handed out by
    /// future `acquire` calls. Must only be called when no `BTree` built on
    /// top of this source holds an in-flight mutation — growing `slots` can
    /// reallocate, and a handle captured mid-mutation would then dangle.
    pub fn refill(&mut self, count: usize) {
        let start = self.slots.len();
        self.slots.resize_with(start + count, || None);
        self.free.extend(start..start + count);
    }

    /// Slots currently reserved and ready to hand out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> NodeSource<T> for MagazineNodeSource<T> {
    type Handle = usize;

    fn acquire(&mut self, node: T) -> Result<usize, T> {
        let Some(index) = self.free.pop() else { return Err(node) };
        self.slots[index] = Some(node);
        Ok(index)
    }

    fn release(&mut self, handle: usize) -> T {
        let node = self.slots[handle].take().unwrap_or_else(|| {
            panic!("atlas-alloc: double release of magazine slot {handle}");
        });
        self.free.push(handle);
        node
    }

    fn get(&self, handle: usize) -> &T {
        self.slots[handle].as_ref().unwrap_or_else(|| {
            panic!("atlas-alloc: use of released magazine slot {handle}");
        })
    }

    fn get_mut(&mut self, handle: usize) -> &mut T {
        self.slots[handle].as_mut().unwrap_or_else(|| {
            panic!("atlas-alloc: use of released magazine slot {handle}");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MagazineNodeSource;
    use atlas_core::NodeSource;

    #[test]
    fn acquire_fails_until_refilled() {
        let mut magazine: MagazineNodeSource<u32> = MagazineNodeSource::new();
        assert!(magazine.acquire(1).is_err());
        magazine.refill(2);
        let a = magazine.acquire(1).unwrap();
        let b = magazine.acquire(2).unwrap();
        assert!(magazine.acquire(3).is_err());
        assert_eq!(*magazine.get(a), 1);
        assert_eq!(*magazine.get(b), 2);
    }

    #[test]
    fn release_makes_a_slot_reusable_without_refill() {
        let mut magazine: MagazineNodeSource<u32> = MagazineNodeSource::new();
        magazine.refill(1);
        let a = magazine.acquire(10).unwrap();
        assert_eq!(magazine.release(a), 10);
        let b = magazine.acquire(20).unwrap();
        assert_eq!(*magazine.get(b), 20);
    }
}
