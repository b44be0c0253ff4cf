// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`SharedCache`]: the single large shared-cache file/mapping and its
//! in-line image table, grounded on
//! `ProcessAtlas.h`'s `SharedCache` and
//! `dyld3/shared-cache/dyld_cache_format.h`'s on-disk layout, consumed here
//! as an opaque typed record per the scope note.

use std::path::Path;
use std::sync::Arc;

use atlas_core::{Address, Error, Result, Uuid};
use atlas_fs::{FileManager, FileRecord};

use crate::header::{self, CacheHeader, ImageTextInfo};
use crate::mapper::Mapper;

/// Bytes read from the cache's base address to parse the fixed header plus
/// the in-line mapping/image-text/sub-cache arrays. Real caches keep these
/// arrays well inside the first few hundred KiB.
const HEADER_PROBE_SIZE: u64 = 512 * 1024;

/// Known install locations for the shared cache, walked in order by
/// [`SharedCache::for_each_installed_cache_with_system_path`], relative to a supplied system root.
const KNOWN_CACHE_DIRS: &[&str] = &["System/Library/dyld", "System/Cryptexes/OS/System/Library/dyld", "private/var/db/dyld"];

/// A shared cache's declared image, as read from its `dyld_cache_image_text_info`
/// entry: a UUID, an unslid load address, and a byte offset to its install path.
pub struct CacheImage {
    pub uuid: Uuid,
    pub load_address: u64,
    path_offset: u32,
}

pub struct SharedCache {
    file: FileRecord,
    mapper: Arc<Mapper>,
    uuid: Uuid,
    rebased_address: Address,
    size: u64,
    images: Vec<CacheImage>,
    /// Set only by [`SharedCache::descriptor`]: a snapshot reconstructed
    /// from a compact-info buffer knows its cache's declared image count
    /// (the bitmap's bit count) without being able to map and re-parse the
    /// cache's own image-text array, which isn't part of the wire format.
    image_count_override: Option<usize>,
}

impl SharedCache {
    /// Parses a cache's header and image-text array out of `mapper`, which
    /// must already cover at least [`HEADER_PROBE_SIZE`] bytes starting at
    /// `rebased_address`.
    pub fn from_mapper(file: FileRecord, mapper: Arc<Mapper>, rebased_address: Address) -> Result<Self> {
        let probe = mapper.map(rebased_address.as_u64(), HEADER_PROBE_SIZE)?;
        let header = CacheHeader::parse(probe.as_slice())?;
        let uuid = header.uuid();
        let mappings = header::read_mapping_infos(probe.as_slice(), header.mapping_offset(), header.mapping_count());
        let size = mappings.iter().map(|m| m.size).sum();
        let image_texts = header::read_image_text_infos(probe.as_slice(), header.images_text_offset(), header.images_text_count());
        let images = image_texts
            .into_iter()
            .map(|info: ImageTextInfo| CacheImage { uuid: info.uuid, load_address: info.load_address, path_offset: info.path_offset })
            .collect();
        Ok(Self { file, mapper, uuid, rebased_address, size, images, image_count_override: None })
    }

    /// Reconstructs a cache descriptor from a deserialized snapshot: no
    /// per-image array is part of the compact-info wire format, so
    /// `image_count` reports `declared_image_count` (the bitmap's bit
    /// count) instead of `images.len()`, and accessors that need the real
    /// image-text array (`with_image_for_index`, `index_for_unslid_address`,
    /// `for_each_file_path`) simply see none.
    #[must_use]
    pub fn descriptor(file: FileRecord, mapper: Arc<Mapper>, uuid: Uuid, rebased_address: Address, size: u64, declared_image_count: usize) -> Self {
        Self { file, mapper, uuid, rebased_address, size, images: Vec::new(), image_count_override: Some(declared_image_count) }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn rebased_address(&self) -> Address {
        self.rebased_address
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.image_count_override.unwrap_or(self.images.len())
    }

    #[must_use]
    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    #[must_use]
    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn for_each_image(&self, mut f: impl FnMut(usize, &CacheImage)) {
        for (index, image) in self.images.iter().enumerate() {
            f(index, image);
        }
    }

    #[must_use]
    pub fn with_image_for_index(&self, index: usize) -> Option<&CacheImage> {
        self.images.get(index)
    }

    /// Finds the index of the cache image whose unslid load address matches
    /// `mh`, i.e. the address a mach header would have before the cache's
    /// runtime slide is applied. Used by `ProcessSnapshot::add_shared_cache_image`.
    #[must_use]
    pub fn index_for_unslid_address(&self, mh: u64) -> Option<usize> {
        self.images.iter().position(|image| image.load_address == mh)
    }

    /// Invokes `f(path)` for every image's install path, resolved lazily
    /// from the cache's string pool via its `Mapper`.
    pub fn for_each_file_path(&self, mut f: impl FnMut(&str)) -> Result<()> {
        const MAX_PATH_LEN: u64 = 1024;
        for image in &self.images {
            let addr = self.rebased_address.as_u64() + u64::from(image.path_offset);
            let mapped = self.mapper.map(addr, MAX_PATH_LEN)?;
            let bytes = mapped.as_slice();
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            f(&String::from_utf8_lossy(&bytes[..len]));
        }
        Ok(())
    }

    pub fn pin(&self) -> Result<()> {
        self.mapper.pin()
    }

    pub fn unpin(&self) {
        self.mapper.unpin();
    }

    /// Walks the fixed list of known cache install directories under
    /// `system_root`, constructing a [`SharedCache`] for every regular,
    /// non-sub-cache file found.
    ///
    /// Sub-cache detection is name-based: sibling files produced alongside
    /// a primary cache (`dyld_shared_cache_arm64e.1`, `…development`,
    /// `…symbols`) carry a `.`-separated suffix after the primary name; this
    /// walk keeps only files with no such suffix. A stricter check would
    /// parse `subCacheArrayOffset` out of every candidate, but that requires
    /// mapping the file first — name filtering avoids mapping files that are
    /// never going to be treated as primary.
    pub fn for_each_installed_cache_with_system_path(
        system_root: &Path,
        file_manager: &Arc<FileManager>,
        mut f: impl FnMut(SharedCache),
    ) -> Result<()> {
        for dir in KNOWN_CACHE_DIRS {
            let dir_path = system_root.join(dir);
            let Ok(entries) = std::fs::read_dir(&dir_path) else { continue };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else { continue };
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with("dyld_shared_cache_") {
                    continue;
                }
                if name["dyld_shared_cache_".len()..].contains('.') {
                    continue; // sub-cache or symbols sibling
                }
                let path = entry.path();
                let Ok(canonical) = std::fs::canonicalize(&path) else { continue };
                let path_str = canonical.to_string_lossy().into_owned();
                let file = file_manager.file_record_for_path(path_str);
                let Ok(fd) = std::fs::File::open(&canonical) else { continue };
                let mapper = match map_whole_file(&fd) {
                    Ok(mapper) => mapper,
                    Err(_) => continue,
                };
                match SharedCache::from_mapper(file, Arc::new(mapper), Address::new(0)) {
                    Ok(cache) => f(cache),
                    Err(_) => continue,
                }
            }
        }
        Ok(())
    }
}

fn map_whole_file(file: &std::fs::File) -> Result<Mapper> {
    use std::os::fd::AsRawFd;
    let len = file.metadata().map_err(Error::from)?.len();
    let mapping = crate::mapper::Mapping::file_backed(0, len, 0, file.as_raw_fd());
    Ok(Mapper::new(vec![mapping]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Mapping;
    use std::ptr::NonNull;

    fn sample_cache_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 65536];
        buf[0..15].copy_from_slice(b"dyld_v1  arm64e");
        // mapping table: one entry at offset 1000 covering [0, 0x10000)
        buf[16..20].copy_from_slice(&1000u32.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[1000..1008].copy_from_slice(&0u64.to_le_bytes()); // address
        buf[1008..1016].copy_from_slice(&0x10000u64.to_le_bytes()); // size
        // images-text table: one entry at offset 2000
        buf[136..144].copy_from_slice(&2000u64.to_le_bytes());
        buf[144..152].copy_from_slice(&1u64.to_le_bytes());
        buf[2000..2016].copy_from_slice(&[0xCD; 16]); // uuid
        buf[2016..2024].copy_from_slice(&0x1_0000_0000u64.to_le_bytes()); // load address
        buf[2028..2032].copy_from_slice(&3000u32.to_le_bytes()); // path offset
        buf[88..104].copy_from_slice(&[0xAB; 16]); // cache uuid
        let path = b"/usr/lib/libfoo.dylib\0";
        buf[3000..3000 + path.len()].copy_from_slice(path);
        buf
    }

    #[test]
    fn parses_header_image_table_and_resolves_a_path() {
        let bytes = sample_cache_bytes();
        let local = NonNull::new(bytes.as_ptr() as *mut u8).unwrap();
        let mapper = Arc::new(Mapper::new(vec![Mapping::resident(0, bytes.len() as u64, local)]));
        let manager = Arc::new(FileManager::new());
        let file = manager.file_record_for_path("/cache");
        let cache = SharedCache::from_mapper(file, mapper, Address::new(0)).expect("parse cache");
        assert_eq!(*cache.uuid().as_bytes(), [0xAB; 16]);
        assert_eq!(cache.image_count(), 1);
        assert_eq!(cache.size(), 0x10000);
        let image = cache.with_image_for_index(0).expect("image 0");
        assert_eq!(*image.uuid.as_bytes(), [0xCD; 16]);
        assert_eq!(image.load_address, 0x1_0000_0000);
        let mut paths = Vec::new();
        cache.for_each_file_path(|p| paths.push(p.to_string())).expect("paths");
        assert_eq!(paths, vec!["/usr/lib/libfoo.dylib".to_string()]);
    }
}
