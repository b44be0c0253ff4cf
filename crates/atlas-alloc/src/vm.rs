// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Virtual-memory primitives: the floor everything else in this crate is
//! built on. Grounded on `Allocator.cpp`'s
//! `Allocator::vm_allocate_bytes`/`vm_deallocate_bytes`: a page-rounded
//! mapping with a trailing unmapped guard page, 1 MiB-aligned where the
//! platform benefits from it, and fatal (not recoverable) on failure.

use atlas_core::Address;

/// A `(address, size)` pair describing one VM-backed region or a free
/// sub-range within one. Never straddles a guard page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Buffer {
    pub address: Address,
    pub size: usize,
}

impl Buffer {
    #[must_use]
    pub const fn new(address: Address, size: usize) -> Self {
        Self { address, size }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.size == 0 || !self.address.is_null()
    }

    #[must_use]
    pub fn last_address(&self) -> Address {
        self.address.offset(self.size.saturating_sub(1) as u64)
    }

    #[must_use]
    pub fn end(&self) -> Address {
        self.address.offset(self.size as u64)
    }

    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.size > 0
            && self.address.as_u64() <= other.address.as_u64()
            && other.end().as_u64() <= self.end().as_u64()
    }

    /// `true` if `self` ends exactly where `other` begins.
    #[must_use]
    pub fn succeeds(&self, other: &Self) -> bool {
        self.end() == other.address
    }

    /// Finds a sub-range of `self` at least `prefix + target_size` bytes
    /// long, with the byte at `prefix` aligned to `target_alignment`.
    /// Returns `None` if no such sub-range fits.
    #[must_use]
    pub fn find_space(&self, target_size: usize, target_alignment: usize, prefix: usize) -> Option<Self> {
        let mut candidate = self.address.as_u64();
        loop {
            let aligned = candidate
                .checked_add(prefix as u64)?
                .next_multiple_of(target_alignment as u64)
                .checked_sub(prefix as u64)?;
            let needed = (prefix as u64).checked_add(target_size as u64)?;
            let region_end = aligned.checked_add(needed)?;
            if region_end > self.end().as_u64() {
                return None;
            }
            if aligned >= self.address.as_u64() {
                return Some(Self::new(Address::new(aligned), needed as usize));
            }
            candidate = candidate.checked_add(target_alignment as u64)?;
        }
    }
}

#[cfg(target_os = "macos")]
const VM_ALIGNMENT_TARGET: usize = 1024 * 1024;
#[cfg(not(target_os = "macos"))]
const VM_ALIGNMENT_TARGET: usize = 0;

#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name constant never touches memory.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

fn page_round_up(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Maps `size` (rounded up to a whole number of pages) plus one unmapped
/// guard page. On platforms that benefit from it, over-allocates and trims
/// to land the returned base on a 1 MiB boundary. Aborts the process on
/// failure — VM exhaustion is unrecoverable for every caller in this crate.
#[must_use]
pub fn vm_allocate_bytes(size: usize) -> Buffer {
    let rounded = page_round_up(size.max(1));
    let page = page_size();
    let mapped_size = rounded + page;

    let alignment = VM_ALIGNMENT_TARGET;
    let (base, reserved_size) = if alignment > rounded {
        map_aligned(mapped_size, alignment)
    } else {
        (raw_map(mapped_size), mapped_size)
    };

    // SAFETY: `base + rounded` is within the mapping just established;
    // mprotect only changes protection bits, it cannot move or unmap.
    let guard_result = unsafe { libc::mprotect(base.add(rounded), page, libc::PROT_NONE) };
    if guard_result != 0 {
        log::error!("atlas-alloc: mprotect(guard page) failed: errno {}", std::io::Error::last_os_error());
        std::process::abort();
    }

    log::trace!("atlas-alloc: vm_allocate_bytes({size}) -> {rounded} bytes at {:p} (reserved {reserved_size})", base);
    Buffer::new(Address::new(base as u64), rounded)
}

fn raw_map(size: usize) -> *mut u8 {
    // SAFETY: arguments describe an anonymous, non-fixed mapping; the
    // kernel chooses the address and we never pass a stale fd/offset.
    let addr = unsafe {
        libc::mmap(std::ptr::null_mut(), size, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | libc::MAP_ANON, -1, 0)
    };
    if addr == libc::MAP_FAILED {
        log::error!("atlas-alloc: vm_allocate_bytes({size}) failed: errno {}", std::io::Error::last_os_error());
        std::process::abort();
    }
    addr.cast::<u8>()
}

/// Over-allocates by `alignment` and trims the unaligned head and tail, the
/// fallback `Allocator.cpp` uses when the platform lacks a direct
/// aligned-mmap facility.
fn map_aligned(size: usize, alignment: usize) -> (*mut u8, usize) {
    let oversized = size + alignment;
    let raw = raw_map(oversized);
    let raw_addr = raw as usize;
    let aligned_addr = raw_addr.next_multiple_of(alignment);
    let head_trim = aligned_addr - raw_addr;
    let tail_trim = oversized - head_trim - size;

    if head_trim > 0 {
        // SAFETY: `[raw, raw+head_trim)` lies fully within the mapping just
        // established above and is unmapped exactly once.
        unsafe { libc::munmap(raw.cast(), head_trim) };
    }
    if tail_trim > 0 {
        // SAFETY: the tail lies within the same mapping, past the region
        // this call retains, and is unmapped exactly once.
        unsafe { libc::munmap(raw.add(head_trim + size).cast(), tail_trim) };
    }
    (raw.wrapping_add(head_trim), size)
}

/// Releases a region (and its guard page) previously returned by
/// [`vm_allocate_bytes`].
pub fn vm_deallocate_bytes(address: Address, size: usize) {
    let page = page_size();
    let rounded = page_round_up(size.max(1));
    let total = rounded + page;
    // SAFETY: caller guarantees `address` is the base of a live mapping of
    // at least `total` bytes obtained from `vm_allocate_bytes`.
    let result = unsafe { libc::munmap(address.as_mut_ptr::<u8>(), total) };
    if result != 0 {
        log::warn!("atlas-alloc: vm_deallocate_bytes({address:?}, {size}) failed: errno {}", std::io::Error::last_os_error());
    } else {
        log::trace!("atlas-alloc: vm_deallocate_bytes({address:?}, {size})");
    }
}

/// Flips the protection of a live VM range between read-only and
/// read-write. Best-effort: failures are logged, not propagated.
pub fn write_protect(address: Address, size: usize, protect: bool) {
    let prot = if protect { libc::PROT_READ } else { libc::PROT_READ | libc::PROT_WRITE };
    // SAFETY: caller guarantees `[address, address+size)` is a live mapping
    // owned by this process.
    let result = unsafe { libc::mprotect(address.as_mut_ptr::<u8>(), size, prot) };
    if result != 0 {
        log::warn!("atlas-alloc: write_protect({address:?}, {protect}) failed: errno {}", std::io::Error::last_os_error());
    }
}
