//! Variable Byte Integer encoding/decoding.
//!
//! MQTT encodes the fixed header's remaining length (and, in 5.0,
//! property lengths and subscription identifiers) with 7 data bits per
//! byte; the high bit says "another byte follows". At most four bytes
//! are allowed:
//!
//! - 0-127: 1 byte
//! - 128-16,383: 2 bytes
//! - 16,384-2,097,151: 3 bytes
//! - 2,097,152-268,435,455: 4 bytes

use bytes::BufMut;

use crate::ProtocolError;

/// Largest value a variable byte integer can carry.
pub const MAX_VALUE: u32 = 268_435_455;

/// Decodes a variable byte integer from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` if
/// `buf` ends before the final byte arrives, and an error when a fifth
/// continuation byte would be needed. Never reads past the integer.
pub fn decode(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut value = 0u32;
    for i in 0..4 {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(ProtocolError::InvalidRemainingLength)
}

/// Encodes `value` into `out`, returning the number of bytes written.
///
/// # Errors
/// Returns [`ProtocolError::VarintOverflow`] if `value > MAX_VALUE`;
/// nothing is written in that case.
pub fn encode(value: u32, out: &mut impl BufMut) -> Result<usize, ProtocolError> {
    if value > MAX_VALUE {
        return Err(ProtocolError::VarintOverflow(value));
    }
    let mut remaining = value;
    let mut written = 0;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        written += 1;
        if remaining == 0 {
            return Ok(written);
        }
    }
}

/// Number of bytes needed to encode `value` (values above
/// [`MAX_VALUE`] report 4, the caller must reject them separately).
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
