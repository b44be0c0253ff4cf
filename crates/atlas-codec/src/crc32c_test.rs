// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

#![allow(clippy::unwrap_used)]

use crate::crc32c::Crc32c;
use proptest::prelude::*;

fn checksum(backend_sw: bool, data: &[u8]) -> u32 {
    let mut crc = if backend_sw { Crc32c::software() } else { Crc32c::new() };
    crc.update(data);
    crc.finish()
}

#[test]
fn known_vector_matches_castagnoli_reference() {
    // "123456789" is the standard CRC32c conformance vector.
    assert_eq!(checksum(true, b"123456789"), 0xE306_9283);
}

#[test]
fn empty_input_checksum_is_zero() {
    assert_eq!(checksum(true, b""), 0);
}

#[test]
fn incremental_updates_match_single_shot() {
    let mut incremental = Crc32c::software();
    incremental.update(b"hello, ");
    incremental.update(b"world");
    let mut single = Crc32c::software();
    single.update(b"hello, world");
    assert_eq!(incremental.finish(), single.finish());
}

#[test]
fn typed_updates_match_byte_slice_updates() {
    let mut typed = Crc32c::software();
    typed.update_u32(0xDEAD_BEEF);
    let mut bytes = Crc32c::software();
    bytes.update(&0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(typed.finish(), bytes.finish());
}

#[test]
fn reset_returns_to_initial_state() {
    let mut crc = Crc32c::software();
    crc.update(b"some data");
    crc.reset();
    assert_eq!(crc.finish(), checksum(true, b""));
}

proptest! {
    #[test]
    fn hardware_and_software_agree(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let sw = checksum(true, &data);
        let hw = checksum(false, &data);
        prop_assert_eq!(sw, hw);
    }
}
