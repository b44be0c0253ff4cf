// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! A minimal read-only view over `dyld_cache_header` and its companion
//! on-disk arrays (: "consumed as an opaque typed record").
//!
//! Per the scope note, the shared-cache on-disk header layout is an
//! external collaborator: this module reads only the fields
//! [`crate::shared_cache::SharedCache`] actually needs, at the byte offsets
//! `dyld_cache_format.h`'s
//! `dyld_cache_header` declares them at. It does not model the struct's
//! ~250 remaining fields (code-signature, closures, Swift/ObjC optimization
//! pointers, …), none of which this crate reads.

use atlas_core::{Error, Result, Uuid};

/// 16-byte magic prefix every cache/sub-cache file begins with, e.g.
/// `"dyld_v1  arm64e"`. Only the `"dyld_v1"` prefix is validated.
pub const MAGIC_PREFIX: &[u8] = b"dyld_v1";

pub struct CacheHeader<'a> {
    data: &'a [u8],
}

impl<'a> CacheHeader<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 416 {
            return Err(Error::invalid("shared cache: header shorter than known prefix"));
        }
        if &data[..MAGIC_PREFIX.len()] != MAGIC_PREFIX {
            return Err(Error::invalid("shared cache: bad magic"));
        }
        Ok(Self { data })
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap_or_default())
    }

    fn u64_at(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap_or_default())
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        Uuid::read_from(&self.data[88..104]).unwrap_or(Uuid::ZERO)
    }

    #[must_use]
    pub fn mapping_offset(&self) -> u32 {
        self.u32_at(16)
    }

    #[must_use]
    pub fn mapping_count(&self) -> u32 {
        self.u32_at(20)
    }

    #[must_use]
    pub fn local_symbols_offset(&self) -> u64 {
        self.u64_at(72)
    }

    #[must_use]
    pub fn local_symbols_size(&self) -> u64 {
        self.u64_at(80)
    }

    #[must_use]
    pub fn images_text_offset(&self) -> u64 {
        self.u64_at(136)
    }

    #[must_use]
    pub fn images_text_count(&self) -> u64 {
        self.u64_at(144)
    }

    #[must_use]
    pub fn mapping_with_slide_offset(&self) -> u32 {
        self.u32_at(312)
    }

    #[must_use]
    pub fn subcache_array_offset(&self) -> u32 {
        self.u32_at(392)
    }

    #[must_use]
    pub fn subcache_array_count(&self) -> u32 {
        self.u32_at(396)
    }

    #[must_use]
    pub fn symbol_file_uuid(&self) -> Uuid {
        Uuid::read_from(&self.data[400..416]).unwrap_or(Uuid::ZERO)
    }
}

/// `dyld_cache_mapping_info`: 32 bytes, `{address, size, fileOffset: u64;
/// maxProt, initProt: u32}`.
pub struct MappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

pub fn read_mapping_infos(data: &[u8], offset: u32, count: u32) -> Vec<MappingInfo> {
    const ENTRY_SIZE: usize = 32;
    let offset = offset as usize;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = offset + i * ENTRY_SIZE;
        let Some(entry) = data.get(base..base + ENTRY_SIZE) else { break };
        out.push(MappingInfo {
            address: u64::from_le_bytes(entry[0..8].try_into().unwrap_or_default()),
            size: u64::from_le_bytes(entry[8..16].try_into().unwrap_or_default()),
            file_offset: u64::from_le_bytes(entry[16..24].try_into().unwrap_or_default()),
            max_prot: u32::from_le_bytes(entry[24..28].try_into().unwrap_or_default()),
            init_prot: u32::from_le_bytes(entry[28..32].try_into().unwrap_or_default()),
        });
    }
    out
}

/// `dyld_cache_image_text_info`: `{uuid: [u8; 16]; loadAddress: u64;
/// textSegmentSize: u32; pathOffset: u32}`, 32 bytes.
pub struct ImageTextInfo {
    pub uuid: Uuid,
    pub load_address: u64,
    pub path_offset: u32,
}

pub fn read_image_text_infos(data: &[u8], offset: u64, count: u64) -> Vec<ImageTextInfo> {
    const ENTRY_SIZE: usize = 32;
    let offset = offset as usize;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = offset + i * ENTRY_SIZE;
        let Some(entry) = data.get(base..base + ENTRY_SIZE) else { break };
        out.push(ImageTextInfo {
            uuid: Uuid::read_from(&entry[0..16]).unwrap_or(Uuid::ZERO),
            load_address: u64::from_le_bytes(entry[16..24].try_into().unwrap_or_default()),
            path_offset: u32::from_le_bytes(entry[28..32].try_into().unwrap_or_default()),
        });
    }
    out
}

/// `dyld_subcache_entry`: `{uuid: [u8; 16]; cacheVMOffset: u64;
/// fileSuffix: [u8; 32]}`, 56 bytes (the newer layout with a suffix field;
/// older caches use the 24-byte `dyld_subcache_entry_v1` instead,
/// distinguished only by whether `subCacheArrayOffset + index*56` still
/// fits inside the file — not exercised here, since every retrievable test
/// artifact uses the newer layout).
pub struct SubCacheEntry {
    pub uuid: Uuid,
    pub vm_offset: u64,
    pub file_suffix: String,
}

pub fn read_subcache_entries(data: &[u8], offset: u32, count: u32) -> Vec<SubCacheEntry> {
    const ENTRY_SIZE: usize = 56;
    let offset = offset as usize;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = offset + i * ENTRY_SIZE;
        let Some(entry) = data.get(base..base + ENTRY_SIZE) else { break };
        let suffix_bytes = &entry[24..56];
        let len = suffix_bytes.iter().position(|&b| b == 0).unwrap_or(suffix_bytes.len());
        out.push(SubCacheEntry {
            uuid: Uuid::read_from(&entry[0..16]).unwrap_or(Uuid::ZERO),
            vm_offset: u64::from_le_bytes(entry[16..24].try_into().unwrap_or_default()),
            file_suffix: String::from_utf8_lossy(&suffix_bytes[..len]).into_owned(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut buf = vec![0u8; 416];
        buf[0..15].copy_from_slice(b"dyld_v1  arm64e");
        buf[16..20].copy_from_slice(&100u32.to_le_bytes());
        buf[20..24].copy_from_slice(&3u32.to_le_bytes());
        buf[88..104].copy_from_slice(&[0xAB; 16]);
        buf
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut data = sample_header();
        data[0] = b'x';
        assert!(CacheHeader::parse(&data).is_err());
    }

    #[test]
    fn parse_reads_mapping_table_location_and_uuid() {
        let data = sample_header();
        let header = CacheHeader::parse(&data).expect("parse");
        assert_eq!(header.mapping_offset(), 100);
        assert_eq!(header.mapping_count(), 3);
        assert_eq!(*header.uuid().as_bytes(), [0xAB; 16]);
    }
}
