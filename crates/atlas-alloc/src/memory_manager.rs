// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The process-wide lock every allocator operation runs under.
//!
//! Grounded on `Allocator.cpp`'s `MemoryManager`:
//! a single `os_unfair_lock`-backed mutex with a scoped guard, plus a
//! best-effort `writeProtect` toggle that flips every region an allocator
//! owns between read-only and read-write. Modeled here with `std::sync::Mutex`
//! rather than a raw futex wrapper — nothing in this crate runs before libc's
//! pthread/mutex primitives are available, unlike the source, which must also
//! serve dyld's own bootstrap before libSystem is up.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::vm::{self, Buffer};

/// Owns the single lock shared by every allocator operation in this process.
#[derive(Default)]
pub struct MemoryManager {
    lock: Mutex<()>,
}

/// A scoped token held for the duration of one allocator operation.
///
/// Releases the lock on drop; callers never unlock explicitly, mirroring the
/// source's `Lock::Guard` RAII wrapper.
pub struct LockGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl MemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Acquires the process-wide lock. A poisoned lock (a prior holder
    /// panicked mid-mutation) is still usable — the allocator's own
    /// invariants, not poisoning, are the source of truth here, matching the
    /// source's non-reentrant `os_unfair_lock`, which has no poison concept.
    #[must_use]
    pub fn lock_guard(&self) -> LockGuard<'_> {
        LockGuard(self.lock.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Flips every region in `regions` between read-only and read-write.
    /// Best-effort: a denied `mprotect` is logged and otherwise ignored
    ///, the mechanism by which a linker can protect its own allocator
    /// metadata between manipulation windows.
    pub fn write_protect(&self, regions: &[Buffer], protect: bool) {
        let _guard = self.lock_guard();
        for region in regions {
            vm::write_protect(region.address, region.size, protect);
        }
    }
}
