// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`FileManager`]: a process-wide cache mapping a filesystem id to the
//! volume UUID it lives on.
//!
//! Grounded on `FileManager.cpp`'s
//! `FileManager`: a lazily-populated `fsid -> UUID` map, scanned on first
//! miss via the host's mounted-filesystem enumeration, with a null-UUID
//! sentinel recorded for filesystems the scan can't resolve so the scan is
//! never repeated for them.

use std::sync::{Mutex, PoisonError};

use atlas_collections::OrderedMap;
use atlas_core::Uuid;
use log::debug;

use crate::file_record::FileRecord;

/// Masks off the high bits Darwin's `fsid_t` tags with a filesystem type;
/// the low 32 bits alone identify the mounted volume.
const FSID_MASK: u64 = 0x00ff_ffff_ff;

/// Caches filesystem-id to volume-UUID resolutions and hands out
/// [`FileRecord`]s that can later resolve themselves back through it.
pub struct FileManager {
    fs_uuid_map: Mutex<OrderedMap<u64, Uuid>>,
}

impl FileManager {
    #[must_use]
    pub fn new() -> Self {
        Self { fs_uuid_map: Mutex::new(OrderedMap::new()) }
    }

    /// A record identified by an explicit path. No stat is performed until
    /// one of [`FileRecord`]'s accessors needs it.
    #[must_use]
    pub fn file_record_for_path(self: &std::sync::Arc<Self>, path: impl Into<String>) -> FileRecord {
        FileRecord::from_path(self.clone(), path.into())
    }

    /// A record identified by a `(volume, object id)` pair — the persistent
    /// identity form, stable across renames.
    #[must_use]
    pub fn file_record_for_volume_and_object(self: &std::sync::Arc<Self>, volume: Uuid, object_id: u64) -> FileRecord {
        FileRecord::from_volume_and_object(self.clone(), volume, object_id)
    }

    /// A record identified by a raw device id and object id, resolving the
    /// device to a volume UUID through this manager's cache.
    #[must_use]
    pub fn file_record_for_device_and_object(self: &std::sync::Arc<Self>, device: u64, object_id: u64) -> FileRecord {
        let volume = self.uuid_for_filesystem(device);
        FileRecord::from_device_and_object(self.clone(), device, object_id, volume)
    }

    /// A record built from a previously observed `(inode, device, mtime)`
    /// triple, e.g. round-tripped out of a snapshot. When all three are
    /// non-zero the record is considered already stat-equivalent and will
    /// not re-stat on `exists()`/`mtime()`, matching the source's
    /// `FileRecord(FileManager&, uint64_t, uint64_t, uint64_t)` constructor.
    #[must_use]
    pub fn file_record_for_identity(self: &std::sync::Arc<Self>, inode: u64, device: u64, mtime: u64) -> FileRecord {
        let volume = self.uuid_for_filesystem(device);
        FileRecord::from_identity(self.clone(), inode, device, mtime, volume)
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, OrderedMap<u64, Uuid>> {
        self.fs_uuid_map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a filesystem id to its volume UUID, scanning mounted
    /// filesystems on a cache miss and recording a zero-UUID sentinel if the
    /// scan still can't resolve it.
    #[must_use]
    pub fn uuid_for_filesystem(&self, fsid: u64) -> Uuid {
        let fsid = fsid & FSID_MASK;
        let mut map = self.lock_map();
        if let Some(uuid) = map.get(&fsid) {
            return *uuid;
        }
        self.reload_fs_infos(&mut map);
        if let Some(uuid) = map.get(&fsid) {
            return *uuid;
        }
        map.insert(fsid, Uuid::ZERO);
        Uuid::ZERO
    }

    /// Resolves a volume UUID back to its filesystem id by linear scan,
    /// rescanning mounted filesystems once if not found.
    #[must_use]
    pub fn fsid_for_uuid(&self, uuid: Uuid) -> u64 {
        let mut map = self.lock_map();
        let mut found = None;
        map.for_each(|fsid, candidate| {
            if found.is_none() && *candidate == uuid {
                found = Some(*fsid);
            }
        });
        if let Some(fsid) = found {
            return fsid;
        }
        self.reload_fs_infos(&mut map);
        let mut found = None;
        map.for_each(|fsid, candidate| {
            if found.is_none() && *candidate == uuid {
                found = Some(*fsid);
            }
        });
        found.unwrap_or(0)
    }

    /// Opens by persistent identity when a volume and object id are both
    /// known, matching `FileRecord::open`'s preference for `openbyid_np`
    /// over a path-based open. Returns `-1` (and lets the caller fall back
    /// to opening by path) when persistent identity isn't available or the
    /// platform doesn't support it.
    pub(crate) fn open_by_id(&self, volume: Uuid, object_id: u64, flags: i32) -> i32 {
        if volume.is_zero() || object_id == 0 {
            return -1;
        }
        let fsid = self.fsid_for_uuid(volume);
        if fsid == 0 {
            return -1;
        }
        platform::open_by_id(fsid, object_id, flags)
    }

    /// Resolves `(volume, object id)` to a path, if the volume is known and
    /// the object id is live.
    pub(crate) fn path_for_volume_and_object(&self, volume: Uuid, object_id: u64) -> Option<String> {
        if volume.is_zero() {
            return None;
        }
        let fsid = self.fsid_for_uuid(volume);
        self.path_for_device_and_object(fsid, object_id)
    }

    pub(crate) fn path_for_device_and_object(&self, fsid: u64, object_id: u64) -> Option<String> {
        if fsid == 0 || object_id == 0 {
            return None;
        }
        platform::fsgetpath(fsid, object_id)
    }

    fn reload_fs_infos(&self, map: &mut OrderedMap<u64, Uuid>) {
        debug!("atlas-fs: rescanning mounted filesystems");
        platform::scan_filesystems(map);
    }
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use atlas_collections::OrderedMap;
    use atlas_core::Uuid;

    /// `fsgetpath`/`openbyid_np` are Apple-private syscalls declared in
    /// `<System/sys/fsgetpath.h>`, not wrapped by the `libc` crate; they are
    /// real exported `libSystem` symbols, so a direct `extern "C"` binding
    /// resolves at link time the same way the source calls them.
    mod sys {
        #[repr(C)]
        pub struct FsObjId {
            pub fid_objno: u32,
            pub fid_generation: u32,
        }

        extern "C" {
            pub fn fsgetpath(buf: *mut libc::c_char, bufsize: libc::size_t, fsid: *mut libc::fsid_t, obj_id: u64) -> libc::ssize_t;
            pub fn openbyid_np(fsid: *const libc::fsid_t, obj_id: *const FsObjId, flags: libc::c_int) -> libc::c_int;
        }
    }

    const FSID_MASK: u64 = super::FSID_MASK;

    fn fsid_raw(fsid: u64) -> libc::fsid_t {
        let mut raw: libc::fsid_t = unsafe { std::mem::zeroed() };
        raw.val[0] = (fsid & 0xffff_ffff) as i32;
        raw
    }

    pub(super) fn open_by_id(fsid: u64, object_id: u64, flags: i32) -> i32 {
        let fsid_raw = fsid_raw(fsid);
        let obj_id = sys::FsObjId { fid_objno: (object_id & 0xffff_ffff) as u32, fid_generation: (object_id >> 32) as u32 };
        // SAFETY: both arguments are locally-owned, correctly sized structs;
        // `openbyid_np` only reads them.
        unsafe { sys::openbyid_np(std::ptr::addr_of!(fsid_raw), std::ptr::addr_of!(obj_id), flags) }
    }

    pub(super) fn fsgetpath(fsid: u64, object_id: u64) -> Option<String> {
        let mut fsid_raw = fsid_raw(fsid);
        let mut buf = vec![0_u8; libc::PATH_MAX as usize];
        // SAFETY: `buf` is sized `PATH_MAX` and `fsid_raw` is a valid,
        // locally-owned `fsid_t`; `fsgetpath` only ever writes within `buf`.
        let len = unsafe { sys::fsgetpath(buf.as_mut_ptr().cast(), buf.len(), std::ptr::addr_of_mut!(fsid_raw), object_id) };
        if len < 0 {
            return None;
        }
        buf.truncate(len as usize);
        String::from_utf8(buf).ok()
    }

    pub(super) fn scan_filesystems(map: &mut OrderedMap<u64, Uuid>) {
        loop {
            // SAFETY: a null buffer with `bufsize == 0` only queries the
            // mount count, per `getfsstat(2)`.
            let count = unsafe { libc::getfsstat(std::ptr::null_mut(), 0, libc::MNT_NOWAIT) };
            if count < 0 {
                log::warn!("atlas-fs: getfsstat(count) failed, compact info will use full paths");
                return;
            }
            let mut infos: Vec<libc::statfs> = vec![unsafe { std::mem::zeroed() }; count as usize];
            let buf_size = (infos.len() * std::mem::size_of::<libc::statfs>()) as i32;
            // SAFETY: `infos` has capacity for exactly `buf_size` bytes of
            // `statfs` records, matching the buffer size passed.
            let filled = unsafe { libc::getfsstat(infos.as_mut_ptr(), buf_size, libc::MNT_NOWAIT) };
            if filled != count {
                continue; // mount table changed mid-scan; retry once more.
            }
            for info in &infos {
                let f_fsid = fsid_of(info) & FSID_MASK;
                if map.get(&f_fsid).is_some() {
                    continue;
                }
                if info.f_flags & (libc::MNT_ROOTFS as u32) == 0 {
                    map.insert(f_fsid, Uuid::ZERO);
                    continue;
                }
                let mount_point = mount_point_of(info);
                match query_volume_uuid(&mount_point) {
                    Some(uuid) => map.insert(f_fsid, uuid),
                    None => map.insert(f_fsid, Uuid::ZERO),
                };
            }
            return;
        }
    }

    fn fsid_of(info: &libc::statfs) -> u64 {
        // Darwin's `fsid_t` low word is the same as the backing `dev_t`.
        let val = info.f_fsid.val;
        (val[0] as u32 as u64) | ((val[1] as u32 as u64) << 32)
    }

    fn mount_point_of(info: &libc::statfs) -> std::ffi::CString {
        let bytes: Vec<u8> = info.f_mntonname.iter().take_while(|&&b| b != 0).map(|&b| b as u8).collect();
        std::ffi::CString::new(bytes).unwrap_or_default()
    }

    /// Mirrors `<sys/mount.h>`'s `vol_capabilities_attr_t`: two
    /// four-`uint32_t` sets (capabilities and their validity bitmaps),
    /// indexed by `VOL_CAPABILITIES_FORMAT` (1).
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct VolCapabilitiesAttr {
        capabilities: [u32; 4],
        valid: [u32; 4],
    }

    const VOL_CAPABILITIES_FORMAT: usize = 1;
    const VOL_CAP_FMT_PERSISTENTOBJECTIDS: u32 = 1 << 6;

    /// Queries whether the volume at `mount_point` supports persistent
    /// object ids and, if so, returns its UUID. Grounded on
    /// `FileManager::reloadFSInfos`'s `getattrlist` call requesting
    /// `ATTR_VOL_INFO | ATTR_VOL_CAPABILITIES | ATTR_VOL_UUID`.
    fn query_volume_uuid(mount_point: &std::ffi::CStr) -> Option<Uuid> {
        #[repr(C, packed)]
        #[allow(dead_code)] // `length`/`fsid` are never read; kept for `getattrlist`'s ABI layout.
        struct VolAttrBuf {
            length: u32,
            fsid: libc::fsid_t,
            vol_attrs: VolCapabilitiesAttr,
            vol_uuid: [u8; 16],
        }

        let mut attr_list: libc::attrlist = unsafe { std::mem::zeroed() };
        attr_list.bitmapcount = libc::ATTR_BIT_MAP_COUNT as u16;
        attr_list.commonattr = libc::ATTR_CMN_FSID;
        attr_list.volattr = libc::ATTR_VOL_INFO | libc::ATTR_VOL_CAPABILITIES | libc::ATTR_VOL_UUID;

        let mut attr_buf: VolAttrBuf = unsafe { std::mem::zeroed() };
        // SAFETY: `attr_buf` is sized for the requested attribute set, and
        // `mount_point` is a valid NUL-terminated path.
        let result = unsafe {
            libc::getattrlist(
                mount_point.as_ptr(),
                std::ptr::addr_of_mut!(attr_list).cast(),
                std::ptr::addr_of_mut!(attr_buf).cast(),
                std::mem::size_of::<VolAttrBuf>(),
                0,
            )
        };
        if result != 0 {
            return None;
        }
        let vol_attrs = attr_buf.vol_attrs;
        let vol_uuid = attr_buf.vol_uuid;
        let format_caps = vol_attrs.capabilities[VOL_CAPABILITIES_FORMAT];
        if format_caps & VOL_CAP_FMT_PERSISTENTOBJECTIDS == 0 {
            return None;
        }
        Some(Uuid::from_bytes(vol_uuid))
    }
}

#[cfg(not(target_os = "macos"))]
mod platform {
    use atlas_collections::OrderedMap;
    use atlas_core::Uuid;

    /// On non-Apple Unix there is no volume-UUID concept exposed by the
    /// kernel; every filesystem id that turns up is recorded with a zero
    /// sentinel UUID so [`super::FileManager::uuid_for_filesystem`] never
    /// rescans for it, and [`crate::file_record::FileIdentity::InodeDeviceMtime`]
    /// becomes the primary persistent identity instead of
    /// volume+object-id.
    pub(super) fn scan_filesystems(map: &mut OrderedMap<u64, Uuid>) {
        let Ok(contents) = std::fs::read_to_string("/proc/mounts") else {
            log::warn!("atlas-fs: /proc/mounts unreadable, compact info will use full paths");
            return;
        };
        for line in contents.lines() {
            let Some(mount_point) = line.split_whitespace().nth(1) else { continue };
            let Ok(metadata) = std::fs::metadata(mount_point) else { continue };
            use std::os::unix::fs::MetadataExt;
            let device = metadata.dev();
            if map.get(&device).is_none() {
                map.insert(device, Uuid::ZERO);
            }
        }
    }

    pub(super) fn fsgetpath(_fsid: u64, _object_id: u64) -> Option<String> {
        None
    }

    pub(super) fn open_by_id(_fsid: u64, _object_id: u64, _flags: i32) -> i32 {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::FileManager;
    use atlas_core::Uuid;
    use std::sync::Arc;

    #[test]
    fn unresolvable_filesystem_gets_a_zero_sentinel_and_no_rescan() {
        let manager = FileManager::new();
        let uuid = manager.uuid_for_filesystem(0xffff_ffff);
        assert_eq!(uuid, Uuid::ZERO);
        // Second call must not panic or hang even though nothing new
        // resolves; it should reuse the cached sentinel.
        assert_eq!(manager.uuid_for_filesystem(0xffff_ffff), Uuid::ZERO);
    }

    #[test]
    fn fsid_for_unknown_uuid_is_zero() {
        let manager = FileManager::new();
        assert_eq!(manager.fsid_for_uuid(Uuid::from_bytes([7; 16])), 0);
    }

    #[test]
    fn file_record_for_path_round_trips_through_the_manager() {
        let manager = Arc::new(FileManager::new());
        let record = manager.file_record_for_path("/tmp/example");
        assert!(!record.persistent());
    }
}
