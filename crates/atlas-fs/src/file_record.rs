// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! [`FileRecord`]: a lazily-stat'd handle to one file, identified by path,
//! by `(volume, object id)`, or by a previously observed
//! `(inode, device, mtime)` triple (/ the data model).
//!
//! Grounded on `FileManager.cpp`'s
//! `FileRecord`: `open` prefers an open-by-id syscall when a persistent
//! identity is known and falls back to a path-based open; `stat` fills
//! size/mtime/mode/device/inode lazily, exactly once; `getPath` resolves a
//! persistent identity to a path through the owning `FileManager` on first
//! use.

use std::sync::{Arc, Mutex};

use atlas_core::Uuid;

use crate::file_manager::FileManager;

/// How a [`FileRecord`] names the file it refers to (data model).
#[derive(Clone, Debug)]
pub enum FileIdentity {
    Path(String),
    VolumeAndObject { volume: Uuid, object_id: u64 },
    /// Rust-rework fallback identity for non-Apple Unix targets, where no
    /// volume UUID is available: `(device, inode)` degrades further to a
    /// bare `(device, inode, mtime)` triple, same as the source's
    /// `FileRecord(FileManager&, uint64_t objectID, uint64_t device, uint64_t mtime)`
    /// constructor.
    InodeDeviceMtime { inode: u64, device: u64, mtime: u64 },
}

#[derive(Default)]
struct StatCache {
    /// `None` until a stat is attempted; `Some(Ok(..))`/`Some(Err(()))`
    /// afterwards so repeated calls never stat twice, mirroring the
    /// source's tri-state `_statResult`.
    result: Option<Result<StatInfo, ()>>,
}

#[derive(Clone, Copy, Default)]
struct StatInfo {
    size: u64,
    mtime: i64,
    mode: u32,
    inode: u64,
    device: u64,
}

/// A handle to one file, lazily resolving its path and stat information.
pub struct FileRecord {
    file_manager: Arc<FileManager>,
    identity: FileIdentity,
    path: Mutex<Option<String>>,
    stat_cache: Mutex<StatCache>,
    fd: Mutex<i32>,
}

impl FileRecord {
    pub(crate) fn from_path(file_manager: Arc<FileManager>, path: String) -> Self {
        Self::new(file_manager, FileIdentity::Path(path.clone()), Some(path))
    }

    pub(crate) fn from_volume_and_object(file_manager: Arc<FileManager>, volume: Uuid, object_id: u64) -> Self {
        Self::new(file_manager, FileIdentity::VolumeAndObject { volume, object_id }, None)
    }

    pub(crate) fn from_device_and_object(file_manager: Arc<FileManager>, _device: u64, object_id: u64, volume: Uuid) -> Self {
        Self::new(file_manager, FileIdentity::VolumeAndObject { volume, object_id }, None)
    }

    /// Builds a record from a previously observed identity triple. When
    /// `inode`, `device`, and `mtime` are all non-zero the stat cache is
    /// pre-seeded (mirroring the source marking `_statResult = 0`), even
    /// though `size`/`mode` remain unknown until the caller needs them —
    /// the source has this same asymmetry.
    pub(crate) fn from_identity(file_manager: Arc<FileManager>, inode: u64, device: u64, mtime: u64, volume: Uuid) -> Self {
        let identity = FileIdentity::InodeDeviceMtime { inode, device, mtime };
        let record = Self::new(file_manager, identity, None);
        if inode != 0 && device != 0 && mtime != 0 {
            let mut cache = record.stat_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            cache.result = Some(Ok(StatInfo { size: 0, mtime: mtime as i64, mode: 0, inode, device }));
        }
        let _ = volume;
        record
    }

    fn new(file_manager: Arc<FileManager>, identity: FileIdentity, path: Option<String>) -> Self {
        Self { file_manager, identity, path: Mutex::new(path), stat_cache: Mutex::new(StatCache::default()), fd: Mutex::new(-1) }
    }

    #[must_use]
    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    /// `true` iff this record carries a stable, renameable-safe identity —
    /// a non-zero volume UUID and object id.
    #[must_use]
    pub fn persistent(&self) -> bool {
        matches!(&self.identity, FileIdentity::VolumeAndObject { volume, object_id } if !volume.is_zero() && *object_id != 0)
    }

    #[must_use]
    pub fn volume(&self) -> Uuid {
        match &self.identity {
            FileIdentity::VolumeAndObject { volume, .. } => *volume,
            FileIdentity::Path(_) | FileIdentity::InodeDeviceMtime { .. } => Uuid::ZERO,
        }
    }

    /// The persistent object id half of a `(volume, object)` identity, if
    /// this record carries one.
    #[must_use]
    pub fn object_id(&self) -> Option<u64> {
        match &self.identity {
            FileIdentity::VolumeAndObject { object_id, .. } => Some(*object_id),
            FileIdentity::Path(_) | FileIdentity::InodeDeviceMtime { .. } => None,
        }
    }

    /// Resolves (and caches) this record's path.
    #[must_use]
    pub fn path(&self) -> Option<String> {
        {
            let cached = self.path.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if cached.is_some() {
                return cached.clone();
            }
        }
        let resolved = match &self.identity {
            FileIdentity::Path(path) => Some(path.clone()),
            FileIdentity::VolumeAndObject { volume, object_id } => self.file_manager.path_for_volume_and_object(*volume, *object_id),
            FileIdentity::InodeDeviceMtime { device, inode, .. } => self.file_manager.path_for_device_and_object(*device, *inode),
        };
        *self.path.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = resolved.clone();
        resolved
    }

    /// Opens the file, preferring an open-by-id syscall when this record
    /// carries a persistent identity, falling back to a path-based open.
    ///
    /// # Panics
    /// Panics if this record already holds an open descriptor — matching
    /// the source's `assert(_fd == -1)`.
    pub fn open(&self, flags: i32) -> i32 {
        let mut fd_slot = self.fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(*fd_slot, -1, "atlas-fs: FileRecord::open called on an already-open record");
        let mut fd = -1;
        if let FileIdentity::VolumeAndObject { volume, object_id } = &self.identity {
            fd = self.file_manager.open_by_id(*volume, *object_id, flags);
        }
        if fd == -1 {
            if let Some(path) = self.path() {
                if let Ok(c_path) = std::ffi::CString::new(path) {
                    // SAFETY: `c_path` is a valid NUL-terminated string; `open`
                    // takes ownership of nothing and its result is checked below.
                    fd = unsafe { libc::open(c_path.as_ptr(), flags) };
                }
            }
        }
        *fd_slot = fd;
        fd
    }

    pub fn close(&self) {
        let mut fd_slot = self.fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *fd_slot != -1 {
            // SAFETY: `*fd_slot` was returned by a prior successful `open`
            // on this record and is closed exactly once here.
            unsafe { libc::close(*fd_slot) };
            *fd_slot = -1;
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.stat().is_ok()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.stat().map(|info| info.size).unwrap_or(0)
    }

    #[must_use]
    pub fn mtime(&self) -> i64 {
        self.stat().map(|info| info.mtime).unwrap_or(0)
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.stat().map(|info| info.mode).unwrap_or(0)
    }

    fn stat(&self) -> Result<StatInfo, ()> {
        {
            let cache = self.stat_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(result) = cache.result {
                return result;
            }
        }
        let result = self.do_stat();
        self.stat_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner).result = Some(result);
        result
    }

    fn do_stat(&self) -> Result<StatInfo, ()> {
        let fd = *self.fd.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut buf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = if fd != -1 {
            // SAFETY: `fd` is a descriptor this record opened and still owns.
            unsafe { libc::fstat(fd, &raw mut buf) }
        } else {
            let Some(path) = self.path() else { return Err(()) };
            let Ok(c_path) = std::ffi::CString::new(path) else { return Err(()) };
            // SAFETY: `c_path` is a valid NUL-terminated path.
            unsafe { libc::stat(c_path.as_ptr(), &raw mut buf) }
        };
        if rc != 0 {
            return Err(());
        }
        Ok(StatInfo {
            size: buf.st_size as u64,
            mtime: buf.st_mtime,
            mode: u32::from(buf.st_mode),
            inode: buf.st_ino,
            device: buf.st_dev as u64,
        })
    }
}

impl Drop for FileRecord {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::FileIdentity;
    use crate::file_manager::FileManager;
    use atlas_core::Uuid;
    use std::sync::Arc;

    #[test]
    fn a_path_record_resolves_to_the_same_path() {
        let manager = Arc::new(FileManager::new());
        let record = manager.file_record_for_path("/dev/null");
        assert_eq!(record.path().as_deref(), Some("/dev/null"));
        assert!(!record.persistent());
    }

    #[test]
    fn a_volume_and_object_record_is_persistent_only_with_both_set() {
        let manager = Arc::new(FileManager::new());
        let with_both = manager.file_record_for_volume_and_object(Uuid::from_bytes([1; 16]), 42);
        assert!(with_both.persistent());
        let zero_volume = manager.file_record_for_volume_and_object(Uuid::ZERO, 42);
        assert!(!zero_volume.persistent());
    }

    #[test]
    fn stat_on_dev_null_reports_a_character_device() {
        let manager = Arc::new(FileManager::new());
        let record = manager.file_record_for_path("/dev/null");
        assert!(record.exists());
    }

    #[test]
    fn identity_round_trip_preserves_the_triple() {
        let manager = Arc::new(FileManager::new());
        let record = manager.file_record_for_identity(5, 6, 7);
        let FileIdentity::InodeDeviceMtime { inode, device, mtime } = record_identity(&record) else {
            panic!("expected InodeDeviceMtime identity")
        };
        assert_eq!((inode, device, mtime), (5, 6, 7));
    }

    fn record_identity(record: &super::FileRecord) -> FileIdentity {
        record.identity.clone()
    }
}
