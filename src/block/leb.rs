//! ULEB128 / SLEB128 codec for 32-bit quantities.

use crate::error::DexResult;

/// A 32-bit quantity never needs more than five 7-bit groups.
pub const MAX_GROUPS: usize = 5;

pub fn encode_uleb128(value: u32) -> Vec<u8> {
    let mut result = Vec::with_capacity(5);
    let mut remaining = value;

    loop {
        let mut byte = (remaining & 0x7F) as u8;
        remaining >>= 7;

        if remaining != 0 {
            byte |= 0x80;
        }

        result.push(byte);

        if remaining == 0 {
            break;
        }
    }

    result
}

/// Number of bytes `encode_uleb128(value)` produces.
pub fn uleb128_size(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Decodes an unsigned value spread over at most `max_groups` groups.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_uleb128(encoded: &[u8], max_groups: usize) -> DexResult<(u32, usize)> {
    let max_groups = max_groups.min(MAX_GROUPS);
    let mut value: u32 = 0;

    for count in 0..max_groups {
        let byte = match encoded.get(count) {
            Some(b) => *b,
            None => fail!(Format, "Truncated uleb128 after {} bytes", count),
        };

        if count == 4 && (byte & 0x70) != 0 {
            fail!(Format, "uleb128 fifth group 0x{:02x} carries bits beyond 32", byte);
        }
        value |= ((byte & 0x7F) as u32) << (7 * count as u32);

        if (byte & 0x80) == 0 {
            return Ok((value, count + 1));
        }
    }

    fail!(Format, "uleb128 not terminated within {} bytes", max_groups)
}

pub fn encode_sleb128(value: i32) -> Vec<u8> {
    let mut result = Vec::with_capacity(5);
    let mut remaining = value;

    loop {
        let byte = (remaining & 0x7F) as u8;
        let more = if remaining >= 0 { remaining > 0x3f } else { remaining < -0x40 };
        remaining >>= 7;

        if more {
            result.push(byte | 0x80);
        } else {
            result.push(byte);
            break;
        }
    }

    result
}

pub fn decode_sleb128(encoded: &[u8]) -> DexResult<(i32, usize)> {
    let mut value: u32 = 0;
    let mut bits: u32 = 0;

    for count in 0..MAX_GROUPS {
        let byte = match encoded.get(count) {
            Some(b) => *b,
            None => fail!(Format, "Truncated sleb128 after {} bytes", count),
        };

        value |= ((byte & 0x7F) as u32) << bits;
        bits += 7;

        if (byte & 0x80) == 0 {
            let mut signed = value as i32;
            if bits < 32 {
                let shift = 32 - bits;
                signed = (signed << shift) >> shift;
            }
            return Ok((signed, count + 1));
        }
    }

    fail!(Format, "sleb128 not terminated within {} bytes", MAX_GROUPS)
}

/// `uleb128p1` stores `value + 1`, so -1 (NO_INDEX) encodes as a single zero byte.
pub fn encode_uleb128p1(value: i64) -> Vec<u8> {
    encode_uleb128((value + 1) as u32)
}

pub fn decode_uleb128p1(encoded: &[u8]) -> DexResult<(i64, usize)> {
    let (v, c) = decode_uleb128(encoded, MAX_GROUPS)?;
    Ok((v as i64 - 1, c))
}
