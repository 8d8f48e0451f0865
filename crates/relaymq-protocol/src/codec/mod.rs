//! Packet encoding and decoding.
//!
//! Decoding happens in two stages:
//!
//! 1. [`decode_header`] reads the fixed header (type, flags, remaining
//!    length) from the front of a buffer. It returns `Ok(None)` while
//!    the header is still incomplete, which is how a stream decoder
//!    knows to wait for more bytes.
//! 2. [`decode_packet`] turns the body of one complete frame into a
//!    [`Packet`](crate::Packet).
//!
//! [`Decoder`] ties the two stages to a growing receive buffer, and
//! [`Encoder`] does the reverse for outbound packets. Both are
//! parameterized by the [`ProtocolVersion`](crate::ProtocolVersion)
//! negotiated in CONNECT.

mod decode;
mod decoder;
mod encode;
pub(crate) mod primitives;

pub use decode::decode_packet;
pub use decoder::Decoder;
pub use encode::{Encoder, encode};

use crate::{PacketType, ProtocolError, varint};

/// The fixed header at the start of every MQTT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    /// The low nibble of the first byte.
    pub flags: u8,
    /// Length of the variable header plus payload.
    pub remaining_length: u32,
    /// Bytes taken by the fixed header itself (2 to 5).
    pub header_len: usize,
}

impl FixedHeader {
    /// Header plus body.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.remaining_length as usize
    }
}

/// Reads and validates the fixed header at the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Reserved flag
/// combinations are rejected here so that the body decoders can trust
/// the flags nibble.
pub fn decode_header(buf: &[u8]) -> Result<Option<FixedHeader>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let packet_type = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;

    match packet_type.required_flags() {
        Some(required) if flags != required => {
            return Err(ProtocolError::malformed(format!(
                "invalid flags {flags:#06b} for {packet_type}"
            )));
        }
        Some(_) => {}
        None => {
            let qos = (flags >> 1) & 0b11;
            if qos == 3 {
                return Err(ProtocolError::malformed("PUBLISH with QoS 3"));
            }
            if qos == 0 && flags & 0b1000 != 0 {
                return Err(ProtocolError::malformed("PUBLISH QoS 0 with DUP set"));
            }
        }
    }

    let Some((remaining_length, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_len: 1 + len_bytes,
    }))
}
