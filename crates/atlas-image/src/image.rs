// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`Image`]: one loaded Mach-O binary, grounded on
//! `ProcessAtlas.h`'s `Image` — a
//! `FileRecord`, an optional `SharedCache` back-reference, a lazily-resolved
//! UUID/install-name, and iteration over segments/sections/content via a
//! caller-provided callback.
//!
//! Mach-O parsing itself is delegated to `goblin::mach` (scope note: the
//! Mach-O file parser is an external collaborator) rather than hand-rolled
//! load-command walking, the same way other Mach-O loader crates parse
//! segments/sections through the same API. `Image` never stores a parsed
//! `goblin::mach::MachO` directly — it borrows from the `Mapper`'s probe
//! bytes, which is a new borrow on every call — so parsing happens on demand
//! and only `Uuid`/`String` results are cached.
//!
//! `Image` does not hold a pointer back to its owning [`crate::SharedCache`]
//! (the source's `_sharedCache` field) — `ProcessSnapshot` owns at most one
//! `SharedCache` per snapshot, so a plain `in_shared_cache: bool` plus the
//! cache slide is sufficient and avoids an arena/index indirection with only
//! one possible referent.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use goblin::mach::load_command::CommandVariant;
use goblin::mach::MachO;

use atlas_core::{Address, Error, Result, Uuid};
use atlas_fs::FileRecord;

use crate::mapper::Mapper;

/// Bytes read from the image's base address before anything is known about
/// its true size; covers the Mach-O header and load commands for every
/// dylib this workspace has needed to parse. Mirrors the source's habit of
/// reading a generous, fixed-size prefix before it knows segment layout.
const HEADER_PROBE_SIZE: u64 = 64 * 1024;

#[derive(Default)]
struct Cache {
    uuid: Option<Uuid>,
    installname: Option<Option<String>>,
}

/// One loaded Mach-O image: a file, a mapper over its bytes, and a rebased
/// load address (data model).
pub struct Image {
    file: FileRecord,
    mapper: Arc<Mapper>,
    rebased_address: Address,
    cache_slide: Option<u64>,
    in_shared_cache: bool,
    cache: Mutex<Cache>,
}

impl Image {
    /// A standalone image, mapped directly from its own file.
    #[must_use]
    pub fn standalone(file: FileRecord, mapper: Arc<Mapper>, rebased_address: Address) -> Self {
        Self { file, mapper, rebased_address, cache_slide: None, in_shared_cache: false, cache: Mutex::new(Cache::default()) }
    }

    /// An image that lives inside a shared cache, at `cache_slide` bytes
    /// past the cache's unslid base.
    #[must_use]
    pub fn in_shared_cache(file: FileRecord, mapper: Arc<Mapper>, rebased_address: Address, cache_slide: u64) -> Self {
        Self { file, mapper, rebased_address, cache_slide: Some(cache_slide), in_shared_cache: true, cache: Mutex::new(Cache::default()) }
    }

    /// A standalone image reconstructed from a serialized snapshot: its
    /// UUID is already known from the wire format, so it's seeded directly
    /// rather than re-derived from `mapper` (which, immediately after
    /// deserialize, has no content to parse — see `atlas-snapshot`'s
    /// `Serializer::deserialize`).
    #[must_use]
    pub fn standalone_with_uuid(file: FileRecord, mapper: Arc<Mapper>, rebased_address: Address, uuid: Uuid) -> Self {
        let image = Self::standalone(file, mapper, rebased_address);
        image.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).uuid = Some(uuid);
        image
    }

    #[must_use]
    pub fn rebased_address(&self) -> Address {
        self.rebased_address
    }

    #[must_use]
    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    #[must_use]
    pub fn in_shared_cache(&self) -> bool {
        self.in_shared_cache
    }

    #[must_use]
    pub fn shared_cache_vm_offset(&self) -> Option<u64> {
        self.cache_slide
    }

    #[must_use]
    pub fn filename(&self) -> Option<String> {
        let path = self.file.path()?;
        Some(path.rsplit('/').next().unwrap_or(&path).to_string())
    }

    fn with_macho<T>(&self, f: impl FnOnce(&MachO<'_>) -> T) -> Result<T> {
        let mapped = self.mapper.map(self.rebased_address.as_u64(), HEADER_PROBE_SIZE)?;
        let macho = MachO::parse(mapped.as_slice(), 0).map_err(|_| Error::invalid("image: failed to parse mach-o header"))?;
        Ok(f(&macho))
    }

    /// Resolves (and caches) the image's `LC_UUID` load command. Returns
    /// [`Uuid::ZERO`] if the image carries none or cannot be parsed.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        {
            let cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(uuid) = cache.uuid {
                return uuid;
            }
        }
        let uuid = self
            .with_macho(|macho| {
                macho.load_commands.iter().find_map(|lc| match &lc.command {
                    CommandVariant::Uuid(cmd) => Some(Uuid::from_bytes(cmd.uuid)),
                    _ => None,
                })
            })
            .ok()
            .flatten()
            .unwrap_or(Uuid::ZERO);
        self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).uuid = Some(uuid);
        uuid
    }

    /// Resolves (and caches) the image's `LC_ID_DYLIB` install name, if any.
    #[must_use]
    pub fn installname(&self) -> Option<String> {
        {
            let cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(name) = &cache.installname {
                return name.clone();
            }
        }
        let name = self.with_macho(|macho| macho.name.map(str::to_string)).ok().flatten();
        self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).installname = Some(name.clone());
        name
    }

    #[must_use]
    pub fn pointer_size(&self) -> u32 {
        self.with_macho(|macho| if macho.is_64 { 8 } else { 4 }).unwrap_or(8)
    }

    /// Invokes `f(segment_name, vm_addr, vm_size, initial_protection)` for
    /// every segment in load-command order.
    pub fn for_each_segment(&self, mut f: impl FnMut(&str, u64, u64, i32)) -> Result<()> {
        self.with_macho(|macho| {
            for segment in &macho.segments {
                let name = segment_name(segment.segname);
                f(&name, segment.vmaddr, segment.vmsize, segment.initprot);
            }
        })
    }

    /// Invokes `f(segment_name, section_name, vm_addr, vm_size)` for every
    /// section of every segment, in load-command order.
    pub fn for_each_section(&self, mut f: impl FnMut(&str, &str, u64, u64)) -> Result<()> {
        self.with_macho(|macho| {
            for segment in &macho.segments {
                let seg_name = segment_name(segment.segname);
                let Ok(sections) = segment.sections() else { continue };
                for (section, _) in sections {
                    let sect_name = segment_name(section.sectname);
                    f(&seg_name, &sect_name, section.addr, section.size);
                }
            }
        })
    }

    /// Finds `segment_name` and, if present, maps its full virtual range and
    /// invokes `content_reader(bytes, vm_addr, vm_size)`. Returns `Ok(false)`
    /// if no segment by that name exists.
    pub fn content_for_segment(&self, segment_name_wanted: &str, content_reader: impl FnOnce(&[u8], u64, u64)) -> Result<bool> {
        let found = self.with_macho(|macho| {
            macho.segments.iter().find_map(|segment| {
                let name = segment_name(segment.segname);
                (name == segment_name_wanted).then_some((segment.vmaddr, segment.vmsize))
            })
        })?;
        let Some((vmaddr, vmsize)) = found else { return Ok(false) };
        if vmsize == 0 {
            content_reader(&[], vmaddr, vmsize);
            return Ok(true);
        }
        let mapped = self.mapper.map(self.rebased_address.as_u64() + vmaddr, vmsize)?;
        content_reader(mapped.as_slice(), vmaddr, vmsize);
        Ok(true)
    }
}

fn segment_name(raw: [u8; 16]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.rebased_address == other.rebased_address
    }
}

impl Eq for Image {}

impl PartialOrd for Image {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Images order purely by rebased address (data model: "Ordering between
/// Images is by rebased address").
impl Ord for Image {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rebased_address.cmp(&other.rebased_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_fs::FileManager;

    #[test]
    fn images_order_by_rebased_address_only() {
        let manager = std::sync::Arc::new(FileManager::new());
        let file_a = manager.file_record_for_path("/a");
        let file_b = manager.file_record_for_path("/b");
        let a = Image::standalone(file_a, Arc::new(Mapper::identity()), Address::new(0x1000));
        let b = Image::standalone(file_b, Arc::new(Mapper::identity()), Address::new(0x2000));
        assert!(a < b);
    }

    #[test]
    fn unparsable_image_reports_zero_uuid_rather_than_failing() {
        let manager = std::sync::Arc::new(FileManager::new());
        let file = manager.file_record_for_path("/nonexistent-or-empty");
        let image = Image::standalone(file, Arc::new(Mapper::identity()), Address::new(0));
        assert_eq!(image.uuid(), Uuid::ZERO);
    }
}
