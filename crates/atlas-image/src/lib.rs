// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Mapper, Image, and SharedCache: mapped views over Mach-O files and the
//! dyld shared cache.
//!
//! The layer that turns raw bytes (mmap'd or resident) into typed,
//! structured views. [`Mapper`] is the shared primitive; [`Image`] and
//! [`SharedCache`] are its two consumers, mirroring
//! `ProcessAtlas.h`'s `Mapper`/`Image`/
//! `SharedCache` triple.
//!
//! # Modules
//!
//! - [`mapper`]: [`Mapper`], the mmap/resident/pinned abstraction.
//! - [`header`]: a read-only view over the on-disk shared-cache header,
//!   consumed as an opaque typed record (scope note).
//! - [`image`]: [`Image`], one loaded Mach-O binary.
//! - [`shared_cache`]: [`SharedCache`], the cache file and its image table.

pub mod header;
pub mod image;
pub mod mapper;
pub mod shared_cache;

pub use header::CacheHeader;
pub use image::Image;
pub use mapper::{Mapper, MappedPointer, Mapping};
pub use shared_cache::{CacheImage, SharedCache};
