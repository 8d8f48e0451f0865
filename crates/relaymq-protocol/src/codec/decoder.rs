//! Incremental stream decoder.

use bytes::BytesMut;

use super::{decode_header, decode_packet};
use crate::{Packet, ProtocolError, ProtocolVersion};

/// Cuts complete packets out of a growing receive buffer.
///
/// The transport appends whatever bytes it read (via [`Decoder::extend`]
/// or by reading straight into [`Decoder::buffer_mut`]); each call to
/// [`Decoder::next_packet`] yields at most one packet. How the input was
/// fragmented never changes the packets that come out.
///
/// Each frame is split off the buffer and frozen, so the `Bytes` fields
/// of the decoded packet share that frame's allocation.
#[derive(Debug)]
pub struct Decoder {
    version: ProtocolVersion,
    max_packet_size: usize,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(version: ProtocolVersion, max_packet_size: usize) -> Self {
        Self {
            version,
            max_packet_size,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switches version once CONNECT has been read.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn set_max_packet_size(&mut self, max: usize) {
        self.max_packet_size = max;
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed as a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete packet and its size on the wire, or
    /// `Ok(None)` if more bytes are needed.
    ///
    /// An oversize packet is reported as soon as its fixed header is
    /// readable, without waiting for (or buffering) the body.
    pub fn next_packet(&mut self) -> Result<Option<(Packet, usize)>, ProtocolError> {
        let Some(header) = decode_header(&self.buffer)? else {
            return Ok(None);
        };
        let frame_len = header.frame_len();
        if frame_len > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: frame_len,
                max: self.max_packet_size,
            });
        }
        if self.buffer.len() < frame_len {
            self.buffer.reserve(frame_len - self.buffer.len());
            return Ok(None);
        }

        let frame = self.buffer.split_to(frame_len).freeze();
        let body = frame.slice(header.header_len..);
        let packet = decode_packet(&header, body, self.version)?;
        Ok(Some((packet, frame_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_packet_waits_for_full_frame() {
        let mut decoder = Decoder::new(ProtocolVersion::V3_1_1, 1024);
        decoder.extend(&[0x30, 0x05, 0x00, 0x01]);
        assert!(decoder.next_packet().unwrap().is_none());
        decoder.extend(&[b't', b'h', b'i', 0xC0, 0x00]);
        let (packet, size) = decoder.next_packet().unwrap().unwrap();
        assert!(matches!(packet, Packet::Publish(_)));
        assert_eq!(size, 7);
        let (packet, size) = decoder.next_packet().unwrap().unwrap();
        assert_eq!(packet, Packet::PingReq);
        assert_eq!(size, 2);
        assert!(decoder.next_packet().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_next_packet_rejects_oversize_from_header_alone() {
        let mut decoder = Decoder::new(ProtocolVersion::V3_1_1, 16);
        decoder.extend(&[0x30, 0x80, 0x01]);
        assert!(matches!(
            decoder.next_packet(),
            Err(ProtocolError::PacketTooLarge { size: 131, max: 16 })
        ));
    }
}
