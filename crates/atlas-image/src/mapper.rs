// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`Mapper`]: a list of `(address, size, file_offset, fd)` mappings that
//! abstracts away in-memory vs. on-disk layout for Mach-O files and the
//! shared cache, grounded on
//! `ProcessAtlas.h`'s `Mapper` /
//! `Mapper::Pointer<T>`.
//!
//! Two backends feed a `Mapper`'s mapping list:
//!   - identity: an empty mapping list, used when the reader examines its
//!     own address space (`addr` already points at valid local memory);
//!   - file-backed: one [`Mapping`] per `(file offset, size)` run, realized
//!     lazily through [`memmap2::MmapOptions`] on first [`Mapper::map`] call
//!     that lands in it, the same way other crash-reporting and symbolication
//!     tools map Mach-O/ELF content rather than reading whole files into a
//!     `Vec`.
//!
//! `pin()` additionally copies every mapping into one contiguous anonymous
//! VM allocation (`libc::mmap` with `MAP_ANON`) so that subsequent `map()`
//! calls never touch a file descriptor again; `unpin()` releases it.

use std::ptr::NonNull;
use std::sync::Mutex;

use atlas_core::{Error, Result};
use memmap2::Mmap;

/// One contiguous run: either a direct pointer into this process's own
/// address space (`fd.is_none()`) or a byte range of a file
/// (`fd.is_some()`), covering `[address, address + size)` in the mapper's
/// own virtual-address numbering.
#[derive(Clone)]
pub struct Mapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub fd: Option<std::os::fd::RawFd>,
    local: Option<NonNull<u8>>,
}

// SAFETY: `local`, when present, points at memory owned by this process for
// the lifetime of the `Mapper` that holds it (either a `memmap2::Mmap` kept
// alive alongside it, or an address the caller asserted is valid for as long
// as the `Mapper` lives); `Mapping` never aliases mutable access to it.
unsafe impl Send for Mapping {}
// SAFETY: see above; no interior mutability is exposed through `Mapping`.
unsafe impl Sync for Mapping {}

impl Mapping {
    #[must_use]
    pub fn identity(address: u64, size: u64) -> Self {
        Self { address, size, file_offset: 0, fd: None, local: None }
    }

    #[must_use]
    pub fn file_backed(address: u64, size: u64, file_offset: u64, fd: std::os::fd::RawFd) -> Self {
        Self { address, size, file_offset, fd: Some(fd), local: None }
    }

    /// A mapping already resident in this process, substituted in place of
    /// an mmap when the reader's own loaded shared cache already has the
    /// content at `local`.
    #[must_use]
    pub fn resident(address: u64, size: u64, local: NonNull<u8>) -> Self {
        Self { address, size, file_offset: 0, fd: None, local: Some(local) }
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.address && addr.saturating_add(size) <= self.address.saturating_add(self.size)
    }
}

enum Backing {
    /// No mappings at all: `map()` passes addresses through unchanged.
    Identity,
    /// A flat, contiguous copy produced by `pin()`.
    Pinned { base: NonNull<u8>, size: u64, mappings: Vec<Mapping> },
    /// The normal, unpinned state: a list of mappings, some file-backed,
    /// realized lazily.
    Sparse(Vec<Mapping>),
}

// SAFETY: `Pinned::base` is an anonymous VM allocation owned by this
// `Mapper` and released in `Drop`; nothing else can observe it mutate.
unsafe impl Send for Backing {}
// SAFETY: see above.
unsafe impl Sync for Backing {}

/// Keeps an mmap'd file-backed region alive only as long as the
/// [`MappedPointer`] that vended it; dropped (and `munmap`'d) when the
/// pointer goes out of scope, mirroring the source's `Mapper::Pointer<T>`
/// destructor.
enum Lease {
    None,
    File(Mmap),
}

/// A scoped handle over mapped memory, returned by [`Mapper::map`]. Its
/// destructor unmaps exactly what was mapped for this call (nothing, if the
/// address was already resident).
pub struct MappedPointer {
    ptr: *const u8,
    len: usize,
    _lease: Lease,
}

impl MappedPointer {
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: `ptr` was produced by a successful mmap/pin/identity
        // resolution covering at least `len` bytes, and this `MappedPointer`
        // keeps the backing mapping (if any) alive for at least as long as
        // the returned slice's borrow.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// Maps cache and Mach-O file content into the reader's address space, or
/// re-uses ranges already resident in the reader's own process.
pub struct Mapper {
    backing: Mutex<Backing>,
}

impl Mapper {
    /// An identity mapper: every address is assumed already valid in this
    /// process, used when a `Process` targets itself.
    #[must_use]
    pub fn identity() -> Self {
        Self { backing: Mutex::new(Backing::Identity) }
    }

    #[must_use]
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self { backing: Mutex::new(Backing::Sparse(mappings)) }
    }

    /// The primary accessor. Returns a scoped handle covering
    /// `[addr, addr + size)`. In the common case the range falls entirely
    /// inside one mapping and this returns a direct pointer with no new
    /// `mmap`; for a file-backed mapping a partial, page-rounded `mmap` is
    /// performed and `MappedPointer` munmaps it on drop.
    pub fn map(&self, addr: u64, size: u64) -> Result<MappedPointer> {
        let backing = self.backing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*backing {
            Backing::Identity => {
                // SAFETY: callers of an identity mapper assert `addr` is
                // valid local memory for at least `size` bytes.
                Ok(MappedPointer { ptr: addr as *const u8, len: size as usize, _lease: Lease::None })
            }
            Backing::Pinned { base, size: pinned_size, mappings } => {
                let mapping = mappings
                    .iter()
                    .find(|m| m.contains(addr, size))
                    .ok_or(Error::Invalid { reason: "mapper: address outside pinned range" })?;
                let flat_offset = mapping_flat_offset(mappings, mapping);
                let within = addr - mapping.address;
                let offset = flat_offset + within;
                if offset + size > *pinned_size {
                    return Err(Error::Invalid { reason: "mapper: pinned range too small" });
                }
                // SAFETY: `base` is a live anonymous mapping at least
                // `pinned_size` bytes long; `offset + size <= pinned_size`.
                let ptr = unsafe { base.as_ptr().add(offset as usize) };
                Ok(MappedPointer { ptr: ptr.cast_const(), len: size as usize, _lease: Lease::None })
            }
            Backing::Sparse(mappings) => {
                let mapping = mappings
                    .iter()
                    .find(|m| m.contains(addr, size))
                    .ok_or(Error::Invalid { reason: "mapper: address not covered by any mapping" })?;
                if let Some(local) = mapping.local {
                    // SAFETY: `local` was recorded as resident memory for at
                    // least `mapping.size` bytes by whoever constructed it.
                    let ptr = unsafe { local.as_ptr().add((addr - mapping.address) as usize) };
                    return Ok(MappedPointer { ptr: ptr.cast_const(), len: size as usize, _lease: Lease::None });
                }
                let Some(fd) = mapping.fd else {
                    return Err(Error::invalid("mapper: mapping has neither resident memory nor a file descriptor"));
                };
                let within = addr - mapping.address;
                let file_offset = mapping.file_offset + within;
                let page_size = page_size();
                let page_aligned_offset = file_offset - (file_offset % page_size);
                let offset_in_page = file_offset - page_aligned_offset;
                let map_len = offset_in_page + size;
                // SAFETY: `fd` is a descriptor owned by the `FileRecord`
                // that backs this mapper for at least as long as `Mapper`
                // lives; memmap2 validates the offset/length pair itself.
                // SAFETY: `fd` outlives this mapper; `BorrowedFd` does
                // not take ownership, it only lets memmap2 read the raw fd.
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let mmap = unsafe {
                    memmap2::MmapOptions::new()
                        .offset(page_aligned_offset)
                        .len(map_len as usize)
                        .map(borrowed)
                        .map_err(Error::from)?
                };
                let ptr = mmap.as_ptr();
                // SAFETY: `offset_in_page < map_len` by construction.
                let ptr = unsafe { ptr.add(offset_in_page as usize) };
                Ok(MappedPointer { ptr, len: size as usize, _lease: Lease::File(mmap) })
            }
        }
    }

    /// Materializes every mapping into one contiguous anonymous VM
    /// allocation: in-process (resident) mappings are `memcpy`'d, file-backed
    /// mappings are read in full. After this call, [`Mapper::map`] resolves
    /// purely against the flat copy.
    pub fn pin(&self) -> Result<()> {
        let mut backing = self.backing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Backing::Sparse(mappings) = &*backing else {
            return Ok(());
        };
        let total: u64 = mappings.iter().map(|m| m.size).sum();
        if total == 0 {
            *backing = Backing::Pinned { base: NonNull::dangling(), size: 0, mappings: Vec::new() };
            return Ok(());
        }
        // SAFETY: anonymous, zero-initialized mapping sized `total`,
        // checked for failure immediately below.
        let base = unsafe {
            libc::mmap(std::ptr::null_mut(), total as usize, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | libc::MAP_ANON, -1, 0)
        };
        if base == libc::MAP_FAILED {
            return Err(Error::System(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(base.cast::<u8>()).ok_or_else(|| Error::generic("mapper: pin mmap returned null"))?;
        let mappings_snapshot = mappings.clone();
        let mut offset = 0u64;
        for mapping in &mappings_snapshot {
            // SAFETY: `dst` lies within `[base, base + total)` by the
            // running `offset` invariant below.
            let dst = unsafe { base.as_ptr().add(offset as usize) };
            if let Some(local) = mapping.local {
                // SAFETY: `local` is valid for `mapping.size` bytes (see
                // `Mapping::resident`'s contract); `dst` has room for the same.
                unsafe { std::ptr::copy_nonoverlapping(local.as_ptr(), dst, mapping.size as usize) };
            } else if let Some(fd) = mapping.fd {
                // SAFETY: `fd` is valid for the mapper's lifetime.
                // SAFETY: see the identical borrow above.
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                let mmap = unsafe {
                    memmap2::MmapOptions::new()
                        .offset(mapping.file_offset)
                        .len(mapping.size as usize)
                        .map(borrowed)
                        .map_err(Error::from)?
                };
                // SAFETY: `mmap` is exactly `mapping.size` bytes; `dst` has
                // room for the same.
                unsafe { std::ptr::copy_nonoverlapping(mmap.as_ptr(), dst, mapping.size as usize) };
            } else {
                // SAFETY: no source to read from; leave the zero-filled
                // anonymous page as-is rather than reading uninitialized data.
                unsafe { std::ptr::write_bytes(dst, 0, mapping.size as usize) };
            }
            offset += mapping.size;
        }
        *backing = Backing::Pinned { base, size: total, mappings: mappings_snapshot };
        Ok(())
    }

    /// Releases a `pin()`'d flat copy, returning to the sparse, lazily-mapped
    /// state. A no-op if the mapper was never pinned.
    pub fn unpin(&self) {
        let mut backing = self.backing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Backing::Pinned { base, size, mappings } = &*backing {
            if *size > 0 {
                // SAFETY: `base`/`size` are exactly the allocation `pin()`
                // created.
                unsafe { libc::munmap(base.as_ptr().cast(), *size as usize) };
            }
            *backing = Backing::Sparse(mappings.clone());
        }
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(&*self.backing.lock().unwrap_or_else(std::sync::PoisonError::into_inner), Backing::Pinned { .. })
    }
}

impl Drop for Mapper {
    fn drop(&mut self) {
        self.unpin();
    }
}

fn mapping_flat_offset(mappings: &[Mapping], target: &Mapping) -> u64 {
    let mut offset = 0u64;
    for mapping in mappings {
        if std::ptr::eq(mapping, target) {
            return offset;
        }
        offset += mapping.size;
    }
    offset
}

fn page_size() -> u64 {
    // SAFETY: `sysconf` with a well-known name is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapper_passes_addresses_through() {
        let value: u64 = 0xdead_beef;
        let mapper = Mapper::identity();
        let mapped = mapper.map(std::ptr::addr_of!(value) as u64, 8).expect("identity map");
        assert_eq!(mapped.as_slice(), value.to_ne_bytes());
    }

    #[test]
    fn map_rejects_addresses_outside_every_mapping() {
        let mapper = Mapper::new(vec![Mapping::identity(0x1000, 0x100)]);
        assert!(mapper.map(0x5000, 0x10).is_err());
    }

    #[test]
    fn resident_mapping_resolves_without_a_file_descriptor() {
        let backing = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let local = NonNull::new(backing.as_ptr() as *mut u8).unwrap();
        let mapper = Mapper::new(vec![Mapping::resident(0x2000, backing.len() as u64, local)]);
        let mapped = mapper.map(0x2002, 4).expect("resident map");
        assert_eq!(mapped.as_slice(), &backing[2..6]);
    }

    #[test]
    fn pin_then_unpin_round_trips_resident_content() {
        let backing = vec![9u8, 8, 7, 6];
        let local = NonNull::new(backing.as_ptr() as *mut u8).unwrap();
        let mapper = Mapper::new(vec![Mapping::resident(0x3000, 4, local)]);
        mapper.pin().expect("pin");
        assert!(mapper.is_pinned());
        let mapped = mapper.map(0x3000, 4).expect("map pinned");
        assert_eq!(mapped.as_slice(), &backing[..]);
        mapper.unpin();
        assert!(!mapper.is_pinned());
    }
}
