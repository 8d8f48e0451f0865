//! Field-level readers and writers shared by every packet codec.
//!
//! Readers consume from a `Bytes` cursor so that strings and binary
//! fields come back as zero-copy views into the received frame. Every
//! reader checks the remaining length first; running out of bytes is a
//! malformed packet, never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{ProtocolError, varint};

pub(crate) fn read_u8(buf: &mut Bytes, what: &str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

pub(crate) fn read_u16(buf: &mut Bytes, what: &str) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

pub(crate) fn read_u32(buf: &mut Bytes, what: &str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_u32())
}

pub(crate) fn read_varint(buf: &mut Bytes, what: &str) -> Result<u32, ProtocolError> {
    match varint::decode(buf.chunk())? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(value)
        }
        None => Err(truncated(what)),
    }
}

/// Reads a two-byte length prefixed binary field.
pub(crate) fn read_binary(buf: &mut Bytes, what: &str) -> Result<Bytes, ProtocolError> {
    let len = usize::from(read_u16(buf, what)?);
    if buf.remaining() < len {
        return Err(truncated(what));
    }
    Ok(buf.split_to(len))
}

/// Reads a UTF-8 string field as raw bytes (used for topics and filters,
/// which the broker handles as bytes but must still be valid UTF-8).
pub(crate) fn read_utf8_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes, ProtocolError> {
    let raw = read_binary(buf, what)?;
    check_utf8(&raw, what)?;
    Ok(raw)
}

pub(crate) fn read_string(buf: &mut Bytes, what: &str) -> Result<String, ProtocolError> {
    let raw = read_binary(buf, what)?;
    check_utf8(&raw, what)?;
    // `check_utf8` already validated, this cannot fail.
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::malformed(format!("{what} is not UTF-8")))
}

fn check_utf8(raw: &[u8], what: &str) -> Result<(), ProtocolError> {
    if std::str::from_utf8(raw).is_err() {
        return Err(ProtocolError::malformed(format!("{what} is not UTF-8")));
    }
    if raw.contains(&0) {
        return Err(ProtocolError::malformed(format!("{what} contains U+0000")));
    }
    Ok(())
}

fn truncated(what: &str) -> ProtocolError {
    ProtocolError::malformed(format!("truncated {what}"))
}

pub(crate) fn write_binary(out: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len())
        .map_err(|_| ProtocolError::malformed(format!("field of {} bytes too long", data.len())))?;
    out.put_u16(len);
    out.put_slice(data);
    Ok(())
}

pub(crate) fn write_string(out: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    write_binary(out, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_binary_returns_view_and_advances() {
        let mut buf = Bytes::from_static(&[0x00, 0x03, b'a', b'/', b'b', 0xFF]);
        let field = read_utf8_bytes(&mut buf, "topic").unwrap();
        assert_eq!(&field[..], b"a/b");
        assert_eq!(&buf[..], &[0xFF]);
    }

    #[test]
    fn test_read_binary_truncated_is_malformed() {
        let mut buf = Bytes::from_static(&[0x00, 0x05, b'a']);
        assert!(matches!(
            read_binary(&mut buf, "topic"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_read_string_rejects_invalid_utf8_and_nul() {
        let mut bad = Bytes::from_static(&[0x00, 0x02, 0xC3, 0x28]);
        assert!(read_string(&mut bad, "client id").is_err());
        let mut nul = Bytes::from_static(&[0x00, 0x01, 0x00]);
        assert!(read_string(&mut nul, "client id").is_err());
    }

    #[test]
    fn test_read_u16_big_endian() {
        let mut buf = Bytes::from_static(&[0x12, 0x34]);
        assert_eq!(read_u16(&mut buf, "id").unwrap(), 0x1234);
        assert!(read_u8(&mut buf, "x").is_err());
    }

    #[test]
    fn test_write_string_prefixes_length() {
        let mut out = BytesMut::new();
        write_string(&mut out, "MQTT").unwrap();
        assert_eq!(&out[..], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
    }
}
