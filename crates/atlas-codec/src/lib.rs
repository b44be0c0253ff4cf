// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Wire-format primitives used by the Atlas process-snapshot codec.
//!
//! - [`pvle`]: the prefix-length-encoded variable-length integer used for
//!   every variable-width field in the compact-info format.
//! - [`crc32c`]: the Castagnoli CRC32 checksum protecting the snapshot body.

pub mod crc32c;
pub mod pvle;

#[cfg(test)]
mod crc32c_test;
#[cfg(test)]
mod pvle_test;

pub use crc32c::Crc32c;
