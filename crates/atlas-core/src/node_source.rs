// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The [`NodeSource`] trait seam.
//!
//! The source's B+Tree draws its 256-byte node storage from the very
//! allocator whose free-range indices it backs — a dependency cycle the
//! source breaks with a private refill magazine. `NodeSource`
//! models that seam in Rust: the tree in `atlas-collections` is generic over
//! any `NodeSource<Node<T>>` and never calls a global allocator itself.
//! `atlas-alloc::PersistentAllocator` implements this trait over its own
//! fixed-size magazine for its two free-range trees; `atlas-collections` also
//! ships a plain slab-backed implementation (nodes live in a `Vec`, drawing
//! on the process-global allocator) for every other tree in the workspace,
//! such as the snapshot's ordered image set, where there is no reentrancy
//! hazard to avoid.

/// Supplies and reclaims storage for exactly one node type, `T`.
///
/// Implementors hand out a handle to a reserved, owned slot; the tree is
/// responsible for constructing and later dropping the node before
/// releasing the handle.
pub trait NodeSource<T> {
    /// Opaque handle to a reserved slot. Implementors choose the
    /// representation (a magazine index, a slab index, …).
    type Handle: Copy + Eq;

    /// Reserves a slot and moves `node` into it, returning a handle.
    ///
    /// Returns `node` back as `Err` if no slot is currently available; the
    /// tree treats exhaustion as fatal for the allocator-backed magazine
    /// (running out means the refill invariant was violated, a bug) but as
    /// ordinary allocation failure for the slab-backed implementation.
    fn acquire(&mut self, node: T) -> Result<Self::Handle, T>;

    /// Releases a handle, returning the node that was stored in it.
    ///
    /// Must not be called twice for the same handle without an intervening
    /// `acquire` returning it again.
    fn release(&mut self, handle: Self::Handle) -> T;

    /// Borrows the node behind a handle.
    fn get(&self, handle: Self::Handle) -> &T;

    /// Mutably borrows the node behind a handle.
    fn get_mut(&mut self, handle: Self::Handle) -> &mut T;
}
