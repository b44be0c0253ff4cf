// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

#![allow(clippy::unwrap_used)]

use crate::pvle::{decode_i64, decode_u64, encode_i64, encode_u64};
use proptest::prelude::*;

fn roundtrip_u64(value: u64) -> u64 {
    let mut buf = Vec::new();
    encode_u64(value, &mut buf);
    let mut slice = buf.as_slice();
    let decoded = decode_u64(&mut slice).unwrap();
    assert!(slice.is_empty(), "decoder left {} unconsumed bytes", slice.len());
    decoded
}

#[test]
fn zero_encodes_to_one_byte() {
    let mut buf = Vec::new();
    encode_u64(0, &mut buf);
    assert_eq!(buf, vec![0x01]);
    assert_eq!(roundtrip_u64(0), 0);
}

#[test]
fn values_fitting_seven_bits_use_one_byte() {
    // 127 needs exactly 7 active bits, which fits in the 7 payload bits
    // available in a single byte's stop-bit encoding.
    let mut buf = Vec::new();
    encode_u64(127, &mut buf);
    assert_eq!(buf.len(), 1);
    assert_eq!(roundtrip_u64(127), 127);
}

#[test]
fn crossing_seven_bits_needs_a_second_byte() {
    // 128 needs 8 active bits, one more than fits in a single byte's 7
    // payload bits, so the encoding grows to two bytes.
    let mut buf = Vec::new();
    encode_u64(128, &mut buf);
    assert_eq!(buf.len(), 2);
    assert_eq!(roundtrip_u64(128), 128);
}

#[test]
fn max_packed_width_uses_eight_bytes() {
    let value = (1u64 << 56) - 1;
    let mut buf = Vec::new();
    encode_u64(value, &mut buf);
    assert_eq!(buf.len(), 8);
    assert_eq!(roundtrip_u64(value), value);
}

#[test]
fn values_needing_fifty_seven_bits_use_the_escape_form() {
    let value = 1u64 << 56;
    let mut buf = Vec::new();
    encode_u64(value, &mut buf);
    assert_eq!(buf.len(), 9);
    assert_eq!(buf[0], 0x00);
    assert_eq!(roundtrip_u64(value), value);
}

#[test]
fn u64_max_round_trips_through_escape_form() {
    assert_eq!(roundtrip_u64(u64::MAX), u64::MAX);
}

#[test]
fn decode_rejects_empty_input() {
    let mut slice: &[u8] = &[];
    assert!(decode_u64(&mut slice).is_err());
}

#[test]
fn decode_rejects_truncated_value() {
    let mut buf = Vec::new();
    encode_u64(u64::MAX, &mut buf);
    let mut slice = &buf[..buf.len() - 1];
    assert!(decode_u64(&mut slice).is_err());
}

#[test]
fn signed_round_trips_negative_and_positive() {
    for value in [0i64, -1, 1, i64::MIN, i64::MAX, -127, 127] {
        let mut buf = Vec::new();
        encode_i64(value, &mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(decode_i64(&mut slice).unwrap(), value);
        assert!(slice.is_empty());
    }
}

proptest! {
    #[test]
    fn unsigned_round_trips_every_value(value: u64) {
        prop_assert_eq!(roundtrip_u64(value), value);
    }

    #[test]
    fn signed_round_trips_every_value(value: i64) {
        let mut buf = Vec::new();
        encode_i64(value, &mut buf);
        let mut slice = buf.as_slice();
        let decoded = decode_i64(&mut slice).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert!(slice.is_empty());
    }
}
