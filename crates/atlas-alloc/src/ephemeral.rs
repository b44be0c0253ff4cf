// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The scoped bump allocator backing short-lived, linker-internal work
//!, grounded on `Allocator.cpp`'s
//! `EphemeralAllocator`: an allocator with no `free`, whose only release
//! mechanism is dropping an entire pool's worth of allocations at once via
//! `reset`.
//!
//! Departure from the source: the source threads its pools together with an
//! in-band intrusive linked list (the next pointer lives inside the first
//! bytes of each pool, found the same way `vm_allocate_bytes` finds a guard
//! page). This type keeps a plain `Vec<Buffer>` of pool regions instead —
//! this crate has no constraint against a side table the way the source's
//! bootstrap-before-libSystem code does, and a `Vec` is simpler to get right
//! without running it through a toolchain.

use atlas_core::Address;
use log::trace;

use crate::metadata::GRANULE;
use crate::vm::{self, Buffer};

/// Not derived from a published constant (see
/// [`crate::persistent::PersistentAllocator`]'s equivalent note); chosen
/// smaller than the persistent allocator's default pool since ephemeral
/// allocations are, by definition, transient and bounded.
const DEFAULT_POOL_SIZE: usize = 1024 * 1024;

/// A bump allocator over one or more VM pools, releasable only all at once.
pub struct EphemeralAllocator {
    pools: Vec<Buffer>,
    /// Byte offset of the next free position within the current (last) pool.
    cursor: usize,
}

impl EphemeralAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { pools: Vec::new(), cursor: 0 }
    }

    fn current_pool(&self) -> Option<Buffer> {
        self.pools.last().copied()
    }

    /// Bump-allocates `size` bytes aligned to `alignment`, growing with a
    /// fresh pool if the current one (if any) cannot fit the request.
    #[must_use]
    pub fn alloc(&mut self, alignment: usize, size: usize) -> *mut u8 {
        let alignment = alignment.max(GRANULE);
        if let Some(pool) = self.current_pool() {
            let base = pool.address.as_u64() + self.cursor as u64;
            let aligned = base.next_multiple_of(alignment as u64);
            let end = aligned + size as u64;
            if end <= pool.end().as_u64() {
                self.cursor = (end - pool.address.as_u64()) as usize;
                trace!("atlas-alloc: ephemeral alloc({alignment}, {size}) -> {aligned:#x}");
                // SAFETY: `aligned` lies within `pool`, which this allocator
                // owns exclusively until the next `reset`.
                return unsafe { Address::new(aligned).as_mut_ptr::<u8>() };
            }
        }
        let pool_size = (size + alignment).max(DEFAULT_POOL_SIZE);
        let pool = vm::vm_allocate_bytes(pool_size);
        self.pools.push(pool);
        self.cursor = 0;
        self.alloc(alignment, size)
    }

    /// Releases every pool this allocator has acquired back to the VM layer.
    /// Every pointer previously returned by [`Self::alloc`] is invalidated.
    pub fn reset(&mut self) {
        for pool in self.pools.drain(..) {
            vm::vm_deallocate_bytes(pool.address, pool.size);
        }
        self.cursor = 0;
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl Default for EphemeralAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EphemeralAllocator {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::EphemeralAllocator;

    #[test]
    fn bump_allocations_never_overlap() {
        let mut allocator = EphemeralAllocator::new();
        let a = allocator.alloc(8, 64) as usize;
        let b = allocator.alloc(8, 64) as usize;
        assert_ne!(a, b);
        assert!(b >= a + 64 || a >= b + 64);
    }

    #[test]
    fn reset_allows_pool_reuse() {
        let mut allocator = EphemeralAllocator::new();
        allocator.alloc(8, 64);
        assert_eq!(allocator.pool_count(), 1);
        allocator.reset();
        assert_eq!(allocator.pool_count(), 0);
        allocator.alloc(8, 64);
        assert_eq!(allocator.pool_count(), 1);
    }

    #[test]
    fn an_oversized_request_grows_a_dedicated_pool() {
        let mut allocator = EphemeralAllocator::new();
        let huge = 4 * 1024 * 1024;
        let ptr = allocator.alloc(16, huge);
        assert!(!ptr.is_null());
        assert_eq!(allocator.pool_count(), 1);
    }
}
