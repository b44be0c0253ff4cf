// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`Unique`] and [`Shared`]: smart pointers into a [`PersistentAllocator`]
//!, grounded on `Allocator.h`'s
//! `UniquePtr<T>`/`SharedPtr<T>`, which store nothing but the raw pointer and
//! recover both the owning allocator and the refcounts from the
//! [`AllocationMetadata`] header immediately preceding it.
//!
//! This port keeps the header lookup (so the layout and its refcounts stay
//! faithful to ) but additionally stores the owning `Arc<PersistentAllocator>`
//! directly in each pointer, rather than recovering a `&dyn Allocator` from
//! the header's 49-bit `allocator` backreference. The source needs that
//! backreference because any number of allocator instances can share a
//! process; this crate only ever wraps allocations from `PersistentAllocator`,
//! so a concrete `Arc` is both simpler and sufficient — the backreference bits
//! are written and preserved purely for struct-layout fidelity.
//!
//! Refcount convention: the source's `SharedPtr` counts *extra* owners beyond
//! the first (a freshly constructed `SharedPtr` never calls `incrementRefCount`,
//! so the header starts at 0 and `destroy()` fires when the decremented count
//! underflows past 0). This port instead increments to 1 on construction and
//! frees when a decrement reaches 0 — ordinary `Arc`-style "total owners"
//! counting — because `AllocationMetadata::decrement_ref_count`'s contract
//! (see its doc comment and the already-committed `ref_count_decrements_to_zero_exactly_once`
//! test in `crate::metadata`) was written against that convention, and it
//! matches how every other refcounted type in this crate and the `std::sync::Arc`
//! it sits beside behaves.

use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::metadata::{AllocationMetadata, OwnershipKind, GRANULE};
use crate::persistent::PersistentAllocator;

fn header_of<T>(ptr: NonNull<T>) -> NonNull<AllocationMetadata> {
    // SAFETY: every pointer passed to these helpers was returned by
    // `PersistentAllocator::aligned_alloc`, which always places a header
    // exactly `GRANULE` bytes before the object.
    unsafe { NonNull::new_unchecked(ptr.as_ptr().cast::<u8>().sub(GRANULE).cast::<AllocationMetadata>()) }
}

fn allocate<T>(allocator: &PersistentAllocator, value: T, kind: OwnershipKind) -> NonNull<T> {
    let raw = allocator.aligned_alloc(mem::align_of::<T>(), mem::size_of::<T>());
    // SAFETY: `aligned_alloc` returns a fresh, suitably aligned, writable
    // region at least `size_of::<T>()` bytes long.
    unsafe {
        raw.cast::<T>().write(value);
        (*header_of(NonNull::new_unchecked(raw.cast::<T>())).as_ptr()).set_kind(kind);
        NonNull::new_unchecked(raw.cast::<T>())
    }
}

/// A singly-owned allocation. Never cloned; dropped exactly once, which
/// drops `T` in place and returns its storage to the owning allocator.
pub struct Unique<T> {
    ptr: NonNull<T>,
    allocator: Arc<PersistentAllocator>,
    _marker: PhantomData<T>,
}

// SAFETY: `Unique<T>` behaves like `Box<T>` — sole ownership of a `T` plus a
// handle to a `Sync` allocator — so it is `Send`/`Sync` exactly when `T` is.
unsafe impl<T: Send> Send for Unique<T> {}
unsafe impl<T: Sync> Sync for Unique<T> {}

impl<T> Unique<T> {
    #[must_use]
    pub fn new(allocator: Arc<PersistentAllocator>, value: T) -> Self {
        let ptr = allocate(&allocator, value, OwnershipKind::Unique);
        Self { ptr, allocator, _marker: PhantomData }
    }

    /// Converts this unique allocation into a shared one, re-tagging its
    /// header and seeding the strong refcount to 1.
    #[must_use]
    pub fn into_shared(self) -> Shared<T> {
        let ptr = self.ptr;
        let allocator = self.allocator.clone();
        mem::forget(self);
        // SAFETY: `ptr` was allocated by this module's `allocate` and is
        // still live; no other owner exists yet.
        unsafe {
            let header = header_of(ptr);
            (*header.as_ptr()).set_kind(OwnershipKind::Shared);
            (*header.as_ptr()).increment_ref_count();
        }
        Shared { ptr, allocator, _marker: PhantomData }
    }
}

impl<T> Deref for Unique<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` is valid and exclusively owned for the lifetime of `self`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Unique<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: `ptr` is valid and exclusively owned for the lifetime of `self`.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for Unique<T> {
    fn drop(&mut self) {
        // SAFETY: `ptr` is exclusively owned by `self` and about to be freed.
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            self.allocator.free(self.ptr.as_ptr().cast());
        }
    }
}

/// A reference-counted allocation. Cloning bumps the strong count; the last
/// drop runs `T`'s destructor and returns the storage to the allocator.
pub struct Shared<T> {
    ptr: NonNull<T>,
    allocator: Arc<PersistentAllocator>,
    _marker: PhantomData<T>,
}

// SAFETY: mirrors `std::sync::Arc`'s bound — a `Shared<T>` can be sent or
// shared across threads exactly when `T` is both `Send` and `Sync`, since any
// clone can drop the last reference and run `T`'s destructor from another
// thread.
unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[must_use]
    pub fn new(allocator: Arc<PersistentAllocator>, value: T) -> Self {
        let ptr = allocate(&allocator, value, OwnershipKind::Shared);
        // SAFETY: `ptr` was just allocated by `allocate` above.
        unsafe { (*header_of(ptr).as_ptr()).increment_ref_count() };
        Self { ptr, allocator, _marker: PhantomData }
    }

    #[must_use]
    pub fn strong_count(this: &Self) -> u32 {
        // SAFETY: the header immediately precedes every live `Shared` allocation.
        unsafe { (*header_of(this.ptr).as_ptr()).strong_count() }
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        // SAFETY: `self` is a live owner, so incrementing is always sound.
        unsafe { (*header_of(self.ptr).as_ptr()).increment_ref_count() };
        Self { ptr: self.ptr, allocator: self.allocator.clone(), _marker: PhantomData }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` stays valid as long as any `Shared` owns a reference.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // SAFETY: `ptr`'s header tracks exactly how many `Shared` clones are
        // live; a `true` result means `self` was the last one.
        let was_last = unsafe { (*header_of(self.ptr).as_ptr()).decrement_ref_count() };
        if was_last {
            // SAFETY: no other `Shared` can observe `ptr` after the last
            // decrement reached zero.
            unsafe {
                self.ptr.as_ptr().drop_in_place();
                self.allocator.free(self.ptr.as_ptr().cast());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Shared, Unique};
    use crate::persistent::PersistentAllocator;
    use std::sync::Arc;

    #[test]
    fn unique_round_trips_and_frees_on_drop() {
        let allocator = Arc::new(PersistentAllocator::new());
        let before = allocator.allocated_bytes();
        {
            let boxed = Unique::new(allocator.clone(), 42u64);
            assert_eq!(*boxed, 42);
            assert!(allocator.allocated_bytes() > before);
        }
        assert_eq!(allocator.allocated_bytes(), before);
    }

    #[test]
    fn shared_frees_only_after_every_clone_drops() {
        let allocator = Arc::new(PersistentAllocator::new());
        let before = allocator.allocated_bytes();
        let a = Shared::new(allocator.clone(), String::from("hi"));
        let b = a.clone();
        assert_eq!(Shared::strong_count(&a), 2);
        drop(a);
        assert!(allocator.allocated_bytes() > before);
        assert_eq!(*b, "hi");
        drop(b);
        assert_eq!(allocator.allocated_bytes(), before);
    }

    #[test]
    fn unique_into_shared_preserves_the_value() {
        let allocator = Arc::new(PersistentAllocator::new());
        let unique = Unique::new(allocator.clone(), vec![1, 2, 3]);
        let shared = unique.into_shared();
        assert_eq!(*shared, vec![1, 2, 3]);
        assert_eq!(Shared::strong_count(&shared), 1);
    }
}
