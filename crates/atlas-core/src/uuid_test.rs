// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

#![allow(clippy::unwrap_used)]

use super::Uuid;

#[test]
fn zero_uuid_is_zero() {
    assert!(Uuid::ZERO.is_zero());
    assert!(!Uuid::from_bytes([1; 16]).is_zero());
}

#[test]
fn read_from_requires_sixteen_bytes() {
    let bytes = [0xAAu8; 20];
    let uuid = Uuid::read_from(&bytes).unwrap();
    assert_eq!(uuid.as_bytes(), &[0xAA; 16]);
    assert!(Uuid::read_from(&bytes[..10]).is_none());
}

#[test]
fn display_matches_canonical_form() {
    let uuid = Uuid::from_bytes([
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ]);
    assert_eq!(format!("{uuid}"), "00112233-4455-6677-8899-aabbccddeeff");
}
