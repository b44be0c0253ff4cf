// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Atlas Project Contributors

//! Prefix-length-encoded variable-length integers (PVLE).
//!
//! Ported from the source's `emitPVLEUInt64`/`readPVLEUInt64`: a value's
//! active bit width selects how many bytes the encoding needs, packing a
//! self-describing stop bit into the low bits of the first byte so the
//! decoder can recover the byte count from a single `trailing_zeros` call.
//! Values whose active width exceeds 56 bits use a dedicated 8-byte escape
//! prefixed by a zero byte (whose trailing-zero count of 8 can't occur in the
//! packed form, since the packed form always sets a stop bit within its
//! first byte).

use atlas_core::Error;

/// Number of bits needed to represent `value`, with a floor of 1 (an all-zero
/// value still consumes the smallest non-escape encoding, one byte).
const fn active_bits(value: u64) -> u32 {
    let width = u64::BITS - value.leading_zeros();
    if width == 0 { 1 } else { width }
}

/// Appends `value`'s PVLE encoding to `out`.
pub fn encode_u64(value: u64, out: &mut Vec<u8>) {
    let bits = active_bits(value);
    if bits > 56 {
        out.push(0);
        out.extend_from_slice(&value.to_le_bytes());
        return;
    }
    let byte_count = usize::try_from((bits + 6) / 7).unwrap_or(8);
    let packed = (value << byte_count) | (1u64 << (byte_count - 1));
    out.extend_from_slice(&packed.to_le_bytes()[..byte_count]);
}

/// Decodes one PVLE-encoded value from the front of `data`, advancing it past
/// the bytes consumed.
///
/// # Errors
/// Returns [`Error::Invalid`] if `data` is empty or shorter than the byte
/// count the leading byte declares.
pub fn decode_u64(data: &mut &[u8]) -> Result<u64, Error> {
    let &first = data.first().ok_or(Error::Invalid { reason: "pvle: empty input" })?;
    let additional = first.trailing_zeros();
    if additional == 8 {
        let body = data.get(1..9).ok_or(Error::Invalid { reason: "pvle: truncated escape form" })?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(body);
        *data = &data[9..];
        return Ok(u64::from_le_bytes(bytes));
    }
    let additional = additional as usize;
    if data.len() < 1 + additional {
        return Err(Error::Invalid { reason: "pvle: truncated value" });
    }
    let extra_bit_count = 8 - (additional + 1);
    // Widen before shifting: `first` is a full 8-bit first byte (e.g. `0x80`
    // when `additional == 7`), and `additional + 1` can itself be 8, which
    // overflows a `u8` shift. The C++ original is safe here only because
    // `(uint8_t)data[0]` promotes to `int` before the shift.
    let extra_bits = ((u16::from(first) >> (additional + 1)) & ((1u16 << extra_bit_count) - 1)) as u8;
    let mut bytes = [0u8; 8];
    bytes[..additional].copy_from_slice(&data[1..1 + additional]);
    let mut result = u64::from_le_bytes(bytes);
    result <<= extra_bit_count;
    result |= u64::from(extra_bits);
    *data = &data[1 + additional..];
    Ok(result)
}

/// Appends `value`'s zig-zag-mapped PVLE encoding to `out`.
pub fn encode_i64(value: i64, out: &mut Vec<u8>) {
    encode_u64(zigzag_encode(value), out);
}

/// Decodes one zig-zag-mapped PVLE value from the front of `data`.
///
/// # Errors
/// See [`decode_u64`].
pub fn decode_i64(data: &mut &[u8]) -> Result<i64, Error> {
    decode_u64(data).map(zigzag_decode)
}

const fn zigzag_encode(value: i64) -> u64 {
    ((value >> 63) ^ (value << 1)) as u64
}

const fn zigzag_decode(value: u64) -> i64 {
    if value & 1 != 0 { ((value >> 1) as i64) ^ -1 } else { (value >> 1) as i64 }
}
