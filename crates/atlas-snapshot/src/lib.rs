// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! The process snapshot and its wire format: a `ProcessSnapshot`
//! collects a target's loaded images, at most one shared cache, and a
//! cache-membership bitmap; the `serializer` module turns that state into
//! (and back out of) a CRC32c-protected, PVLE-encoded byte buffer suitable
//! for publishing out-of-process.

pub mod process_snapshot;
pub mod serializer;

pub use process_snapshot::{ProcessSnapshot, SnapshotImage};
pub use serializer::{deserialize, deserialize_with_fallback, serialize};
