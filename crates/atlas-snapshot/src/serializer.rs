// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The compact-info wire format: a fixed 36-byte header, a
//! PVLE-encoded body, and a 16-byte alignment pad, the whole thing protected
//! by a CRC32c computed with its own field zeroed.
//!
//! Grounded on `ProcessAtlas.h`'s nested
//! `Serializer` class, byte-for-byte in field order; interned volume-UUID
//! and path tables are built with [`atlas_collections::OrderedSet`] the same
//! way the source collects them into a sorted set before emission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use atlas_codec::crc32c::Crc32c;
use atlas_codec::pvle;
use atlas_collections::{Bitmap, OrderedSet};
use atlas_core::{Address, Error, Result, Uuid};
use atlas_fs::{FileManager, FileRecord};
use atlas_image::mapper::Mapper;
use atlas_image::{Image, SharedCache};

use crate::process_snapshot::ProcessSnapshot;

const MAGIC: u32 = 0xa71a_5166;
const VERSION: u32 = 0;
const HEADER_SIZE: usize = 36;
const CRC_FIELD_OFFSET: usize = 32;
const ALIGNMENT: usize = 16;

const PROCESS_FLAG_HAS_SHARED_CACHE: u64 = 0x1;
/// Defined on the wire but never set by this crate: a private (non-system)
/// cache isn't a concept `ProcessSnapshot` models.
#[allow(dead_code)]
const PROCESS_FLAG_HAS_PRIVATE_CACHE: u64 = 0x2;
/// Defined on the wire but never set by this crate: `ProcessSnapshot` has no
/// notion of the target's page size, so every address is always scaled by
/// the fixed [`PAGE_SIZE`] below rather than a target-reported one.
#[allow(dead_code)]
const PROCESS_FLAG_HAS_16K_PAGES: u64 = 0x4;

const MAPPED_FILE_HAS_UUID: u64 = 0x1;
const MAPPED_FILE_HAS_FILE_ID: u64 = 0x2;
const MAPPED_FILE_HAS_FILE_PATH: u64 = 0x4;

const PAGE_SIZE: u64 = 4096;

const SENTINEL_PATH: &str = "???";

static GENERATION: AtomicU32 = AtomicU32::new(0);

fn next_generation() -> u32 {
    GENERATION.fetch_add(1, Ordering::Relaxed)
}

fn now_unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// The sorted volume-UUID and path tables a snapshot's images and cache
/// intern into, built once per `serialize` call (step 2–3).
struct Tables {
    volumes: Vec<Uuid>,
    strings: Vec<String>,
    string_offsets: Vec<u64>,
}

impl Tables {
    fn volume_index(&self, uuid: Uuid) -> Option<u64> {
        self.volumes.binary_search(&uuid).ok().map(|i| i as u64)
    }

    fn string_offset(&self, needle: &str) -> Option<u64> {
        let position = self.strings.binary_search_by(|candidate| candidate.as_str().cmp(needle)).ok()?;
        self.string_offsets.get(position).copied()
    }

    fn string_table_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for s in &self.strings {
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
        bytes
    }
}

fn file_identity_key(file: &FileRecord) -> Option<Uuid> {
    file.persistent().then(|| file.volume())
}

fn collect_tables(snapshot: &ProcessSnapshot) -> Tables {
    let mut volumes: OrderedSet<Uuid> = OrderedSet::new();
    let mut strings: OrderedSet<String> = OrderedSet::new();
    let mut note = |file: &FileRecord| {
        if let Some(volume) = file_identity_key(file) {
            volumes.insert(volume);
        } else {
            strings.insert(file.path().unwrap_or_else(|| SENTINEL_PATH.to_string()));
        }
    };
    for image in snapshot.images() {
        note(image.file());
    }
    if let Some(cache) = snapshot.shared_cache() {
        note(cache.file());
    }

    let volumes = volumes.to_vec();
    let strings = strings.to_vec();
    let mut offset = 0u64;
    let mut string_offsets = Vec::with_capacity(strings.len());
    for s in &strings {
        string_offsets.push(offset);
        offset += s.len() as u64 + 1;
    }
    Tables { volumes, strings, string_offsets }
}

/// Appends one `MappedFileInfo` record: `flags`, the (already scaled or
/// delta-encoded) address field, and whichever of UUID / volume+object-id /
/// string-offset the flags declare.
fn emit_mapped_file_info(out: &mut Vec<u8>, tables: &Tables, file: &FileRecord, uuid: Uuid, address_field: u64) {
    let mut flags = 0u64;
    if !uuid.is_zero() {
        flags |= MAPPED_FILE_HAS_UUID;
    }
    let file_id = file_identity_key(file).map(|volume| {
        let index = tables.volume_index(volume).expect("atlas-snapshot: volume collected in first pass");
        (index, file.object_id().expect("atlas-snapshot: persistent record carries an object id"))
    });
    if file_id.is_some() {
        flags |= MAPPED_FILE_HAS_FILE_ID;
    } else {
        flags |= MAPPED_FILE_HAS_FILE_PATH;
    }

    pvle::encode_u64(flags, out);
    pvle::encode_u64(address_field, out);
    if !uuid.is_zero() {
        out.extend_from_slice(uuid.as_bytes());
    }
    if let Some((volume_index, object_id)) = file_id {
        pvle::encode_u64(volume_index, out);
        pvle::encode_u64(object_id, out);
    } else {
        let path = file.path().unwrap_or_else(|| SENTINEL_PATH.to_string());
        let offset = tables.string_offset(&path).expect("atlas-snapshot: path collected in first pass");
        pvle::encode_u64(offset, out);
    }
}

/// The inverse of [`emit_mapped_file_info`]: reconstructs a [`FileRecord`]
/// through `file_manager` and returns `(uuid, address_field, file)`.
fn read_mapped_file_info(data: &mut &[u8], file_manager: &Arc<FileManager>, volumes: &[Uuid], string_table: &[u8]) -> Result<(Uuid, u64, FileRecord)> {
    let flags = pvle::decode_u64(data)?;
    let address_field = pvle::decode_u64(data)?;
    let uuid = if flags & MAPPED_FILE_HAS_UUID != 0 {
        let uuid = Uuid::read_from(data).ok_or_else(|| Error::invalid("snapshot: truncated mapped-file uuid"))?;
        *data = data.get(16..).ok_or_else(|| Error::invalid("snapshot: truncated mapped-file uuid"))?;
        uuid
    } else {
        Uuid::ZERO
    };
    let file = if flags & MAPPED_FILE_HAS_FILE_ID != 0 {
        let volume_index = usize::try_from(pvle::decode_u64(data)?).map_err(|_| Error::invalid("snapshot: volume index overflow"))?;
        let object_id = pvle::decode_u64(data)?;
        let volume = *volumes.get(volume_index).ok_or_else(|| Error::invalid("snapshot: volume index out of range"))?;
        file_manager.file_record_for_volume_and_object(volume, object_id)
    } else if flags & MAPPED_FILE_HAS_FILE_PATH != 0 {
        let offset = usize::try_from(pvle::decode_u64(data)?).map_err(|_| Error::invalid("snapshot: string offset overflow"))?;
        let path = read_nul_string(string_table, offset)?;
        file_manager.file_record_for_path(path)
    } else {
        return Err(Error::invalid("snapshot: mapped-file info has neither a file id nor a path"));
    };
    Ok((uuid, address_field, file))
}

fn read_nul_string(table: &[u8], offset: usize) -> Result<String> {
    let slice = table.get(offset..).ok_or_else(|| Error::invalid("snapshot: string offset out of range"))?;
    let len = slice.iter().position(|&b| b == 0).ok_or_else(|| Error::invalid("snapshot: unterminated string"))?;
    String::from_utf8(slice[..len].to_vec()).map_err(|_| Error::invalid("snapshot: invalid utf8 in string table"))
}

fn placeholder_mapper() -> Arc<Mapper> {
    Arc::new(Mapper::new(Vec::new()))
}

/// Serializes `snapshot` into its compact-info wire form ("Serialize
/// algorithm").
#[must_use]
pub fn serialize(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let tables = collect_tables(snapshot);
    let mut body = Vec::new();

    let mut process_flags = 0u64;
    if snapshot.shared_cache().is_some() {
        process_flags |= PROCESS_FLAG_HAS_SHARED_CACHE;
    }
    pvle::encode_u64(process_flags, &mut body);
    pvle::encode_u64(snapshot.platform(), &mut body);
    pvle::encode_u64(snapshot.initial_image_count(), &mut body);
    pvle::encode_u64(snapshot.dyld_state(), &mut body);

    pvle::encode_u64(tables.volumes.len() as u64, &mut body);
    for uuid in &tables.volumes {
        body.extend_from_slice(uuid.as_bytes());
    }

    let string_bytes = tables.string_table_bytes();
    pvle::encode_u64(string_bytes.len() as u64, &mut body);
    body.extend_from_slice(&string_bytes);

    if let Some(cache) = snapshot.shared_cache() {
        emit_mapped_file_info(&mut body, &tables, cache.file(), cache.uuid(), cache.rebased_address().as_u64() / PAGE_SIZE);
        let bitmap = snapshot.bitmap();
        pvle::encode_u64(bitmap.size() as u64, &mut body);
        body.extend_from_slice(bitmap.bytes());
    }

    pvle::encode_u64(snapshot.image_count() as u64, &mut body);
    let mut previous_address = 0u64;
    for image in snapshot.images() {
        let address = image.rebased_address().as_u64();
        let delta = address.wrapping_sub(previous_address) / PAGE_SIZE;
        emit_mapped_file_info(&mut body, &tables, image.file(), image.uuid(), delta);
        previous_address = address;
    }

    while (HEADER_SIZE + body.len()) % ALIGNMENT != 0 {
        body.push(0);
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // systemInfoAddress: not tracked by ProcessSnapshot
    out.extend_from_slice(&0u32.to_le_bytes()); // systemInfoSize
    out.extend_from_slice(&next_generation().to_le_bytes());
    out.extend_from_slice(&now_unix_seconds().to_le_bytes());
    debug_assert_eq!(out.len(), CRC_FIELD_OFFSET);
    out.extend_from_slice(&0u32.to_le_bytes()); // crc32c, patched below
    out.extend_from_slice(&body);

    let mut crc = Crc32c::new();
    crc.update(&out);
    let crc_value = crc.finish();
    out[CRC_FIELD_OFFSET..CRC_FIELD_OFFSET + 4].copy_from_slice(&crc_value.to_le_bytes());
    out
}

/// Deserializes a compact-info buffer with no fallback hook installed. On
/// any structural error the result is [`ProcessSnapshot::invalid`].
#[must_use]
pub fn deserialize(file_manager: &Arc<FileManager>, data: &[u8]) -> ProcessSnapshot {
    deserialize_with_fallback(file_manager, data, None)
}

/// Deserializes a compact-info buffer, retrying once through `fallback` (an
/// "unwrap" hook modeling the source's platform-specific recovery path) if
/// the primary parse fails. No caller in this crate installs one (Open
/// Questions).
#[must_use]
pub fn deserialize_with_fallback(file_manager: &Arc<FileManager>, data: &[u8], fallback: Option<&dyn Fn(&[u8]) -> Option<Vec<u8>>>) -> ProcessSnapshot {
    if let Ok(snapshot) = try_deserialize(file_manager, data) {
        return snapshot;
    }
    if let Some(fallback) = fallback {
        if let Some(unwrapped) = fallback(data) {
            if let Ok(snapshot) = try_deserialize(file_manager, &unwrapped) {
                return snapshot;
            }
        }
    }
    ProcessSnapshot::invalid()
}

fn try_deserialize(file_manager: &Arc<FileManager>, data: &[u8]) -> Result<ProcessSnapshot> {
    if data.len() < HEADER_SIZE {
        return Err(Error::invalid("snapshot: truncated header"));
    }
    let magic = u32::from_be_bytes(data[0..4].try_into().expect("4 bytes"));
    if magic != MAGIC {
        return Err(Error::invalid("snapshot: bad magic"));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes"));
    if version != VERSION {
        return Err(Error::invalid("snapshot: unsupported version"));
    }
    let stored_crc = u32::from_le_bytes(data[CRC_FIELD_OFFSET..CRC_FIELD_OFFSET + 4].try_into().expect("4 bytes"));
    let mut crc_check = data.to_vec();
    crc_check[CRC_FIELD_OFFSET..CRC_FIELD_OFFSET + 4].fill(0);
    let mut crc = Crc32c::new();
    crc.update(&crc_check);
    if crc.finish() != stored_crc {
        return Err(Error::invalid("snapshot: crc mismatch"));
    }

    let mut rest = &data[HEADER_SIZE..];
    let process_flags = pvle::decode_u64(&mut rest)?;
    let platform = pvle::decode_u64(&mut rest)?;
    let initial_image_count = pvle::decode_u64(&mut rest)?;
    let dyld_state = pvle::decode_u64(&mut rest)?;

    let volume_count = usize::try_from(pvle::decode_u64(&mut rest)?).map_err(|_| Error::invalid("snapshot: volume count overflow"))?;
    let mut volumes = Vec::with_capacity(volume_count);
    for _ in 0..volume_count {
        let uuid = Uuid::read_from(rest).ok_or_else(|| Error::invalid("snapshot: truncated volume uuid"))?;
        rest = rest.get(16..).ok_or_else(|| Error::invalid("snapshot: truncated volume uuid"))?;
        volumes.push(uuid);
    }

    let string_table_size = usize::try_from(pvle::decode_u64(&mut rest)?).map_err(|_| Error::invalid("snapshot: string table size overflow"))?;
    let string_table = rest.get(..string_table_size).ok_or_else(|| Error::invalid("snapshot: truncated string table"))?;
    rest = &rest[string_table_size..];

    let mut snapshot = ProcessSnapshot::new();
    snapshot.set_platform(platform);
    snapshot.set_initial_image_count(initial_image_count);
    snapshot.set_dyld_state(dyld_state);

    if process_flags & PROCESS_FLAG_HAS_SHARED_CACHE != 0 {
        let (uuid, scaled_address, file) = read_mapped_file_info(&mut rest, file_manager, &volumes, string_table)?;
        let declared_bit_count = usize::try_from(pvle::decode_u64(&mut rest)?).map_err(|_| Error::invalid("snapshot: bitmap bit count overflow"))?;
        let (bitmap, remaining) = Bitmap::from_bytes(declared_bit_count, rest).ok_or_else(|| Error::invalid("snapshot: truncated bitmap"))?;
        rest = remaining;
        let cache = SharedCache::descriptor(file, placeholder_mapper(), uuid, Address::new(scaled_address * PAGE_SIZE), 0, declared_bit_count);
        snapshot.install_shared_cache_with_bitmap(cache, bitmap);
    }

    let image_count = usize::try_from(pvle::decode_u64(&mut rest)?).map_err(|_| Error::invalid("snapshot: image count overflow"))?;
    let mut previous_address = 0u64;
    for _ in 0..image_count {
        let (uuid, scaled_delta, file) = read_mapped_file_info(&mut rest, file_manager, &volumes, string_table)?;
        let address = previous_address.wrapping_add(scaled_delta * PAGE_SIZE);
        previous_address = address;
        let image = Image::standalone_with_uuid(file, placeholder_mapper(), Address::new(address), uuid);
        snapshot.add_image(image);
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_image::mapper::Mapping;
    use std::ptr::NonNull;

    fn resident_mapper(bytes: &'static [u8]) -> Arc<Mapper> {
        let local = NonNull::new(bytes.as_ptr() as *mut u8).unwrap();
        Arc::new(Mapper::new(vec![Mapping::resident(0, bytes.len() as u64, local)]))
    }

    /// A synthetic in-memory cache with a 4-entry image-text array, built the
    /// same way `shared_cache::tests::sample_cache_bytes` does.
    fn sample_cache_bytes() -> &'static [u8] {
        let mut buf = vec![0u8; 65536];
        buf[0..15].copy_from_slice(b"dyld_v1  arm64e");
        buf[88..104].copy_from_slice(&[0x0Fu8; 16]);
        buf[136..144].copy_from_slice(&2000u64.to_le_bytes());
        buf[144..152].copy_from_slice(&4u64.to_le_bytes());
        for i in 0..4u64 {
            let base = 2000 + (i as usize) * 32;
            buf[base..base + 16].copy_from_slice(&[i as u8; 16]);
            buf[base + 16..base + 24].copy_from_slice(&(0x1_8000_0000u64 + i * 0x1000).to_le_bytes());
        }
        Box::leak(buf.into_boxed_slice())
    }

    fn build_sample(manager: &Arc<FileManager>) -> ProcessSnapshot {
        let mut snapshot = ProcessSnapshot::new();
        snapshot.set_platform(1);
        snapshot.set_initial_image_count(7);
        snapshot.set_dyld_state(3);

        let cache_file = manager.file_record_for_path("/private/var/db/dyld/dyld_shared_cache_arm64e");
        let cache_bytes = sample_cache_bytes();
        let cache = SharedCache::from_mapper(cache_file, resident_mapper(cache_bytes), Address::new(0x1_8000_0000)).expect("parse synthetic cache");
        snapshot.add_shared_cache(cache);
        assert!(snapshot.add_shared_cache_image(0x1_8000_0000)); // index 0
        assert!(snapshot.add_shared_cache_image(0x1_8000_0000 + 3 * 0x1000)); // index 3

        let file_a = manager.file_record_for_path("/usr/lib/liba.dylib");
        snapshot.add_image(Image::standalone(file_a, resident_mapper(&[]), Address::new(0x1_0000_0000)));
        let file_b = manager.file_record_for_path("/usr/lib/libb.dylib");
        snapshot.add_image(Image::standalone(file_b, resident_mapper(&[]), Address::new(0x1_0001_0000)));

        snapshot
    }

    #[test]
    fn round_trips_platform_state_images_and_cache_bitmap() {
        let manager = Arc::new(FileManager::new());
        let snapshot = build_sample(&manager);
        let cache = snapshot.shared_cache().expect("cache installed");
        assert_eq!(cache.image_count(), 4);
        assert!(snapshot.bitmap().check_bit(0));
        assert!(snapshot.bitmap().check_bit(3));
        assert!(!snapshot.bitmap().check_bit(1));

        let bytes = serialize(&snapshot);
        assert_eq!(bytes.len() % ALIGNMENT, 0);
        assert_eq!(&bytes[0..4], &MAGIC.to_be_bytes());

        let restored = deserialize(&manager, &bytes);
        assert!(restored.valid());
        assert_eq!(restored.platform(), 1);
        assert_eq!(restored.initial_image_count(), 7);
        assert_eq!(restored.dyld_state(), 3);
        assert_eq!(restored.image_count(), 2);
        let addresses: Vec<u64> = restored.images().map(|i| i.rebased_address().as_u64()).collect();
        assert_eq!(addresses, vec![0x1_0000_0000, 0x1_0001_0000]);
        let restored_cache = restored.shared_cache().expect("cache round-tripped");
        assert_eq!(restored_cache.uuid(), cache.uuid());
        assert_eq!(restored_cache.image_count(), 4);
    }

    #[test]
    fn flipping_any_non_crc_byte_invalidates_the_snapshot() {
        let manager = Arc::new(FileManager::new());
        let snapshot = build_sample(&manager);
        let bytes = serialize(&snapshot);

        let mut corrupted = bytes.clone();
        let target = HEADER_SIZE + 2; // well into the PVLE body
        corrupted[target] ^= 0xFF;
        let restored = deserialize(&manager, &corrupted);
        assert!(!restored.valid());
    }

    #[test]
    fn flipping_the_crc_field_itself_is_also_detected() {
        let manager = Arc::new(FileManager::new());
        let snapshot = build_sample(&manager);
        let mut bytes = serialize(&snapshot);
        bytes[CRC_FIELD_OFFSET] ^= 0xFF;
        let restored = deserialize(&manager, &bytes);
        assert!(!restored.valid());
    }

    #[test]
    fn a_file_with_neither_persistent_id_nor_path_serializes_with_the_sentinel_path() {
        let manager = Arc::new(FileManager::new());
        let mut snapshot = ProcessSnapshot::new();
        let volume_only = manager.file_record_for_volume_and_object(Uuid::ZERO, 0); // persistent() is false: zero volume
        snapshot.add_image(Image::standalone(volume_only, resident_mapper(&[]), Address::new(0x2000)));
        let bytes = serialize(&snapshot);
        let restored = deserialize(&manager, &bytes);
        assert!(restored.valid());
        assert_eq!(restored.image_count(), 1);
    }
}
