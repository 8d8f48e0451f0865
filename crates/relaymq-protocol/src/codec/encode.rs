//! Packet encoding.

use bytes::{BufMut, BytesMut};

use super::primitives::{write_binary, write_string};
use crate::packet::{Ack, Connect, Packet, Publish};
use crate::{Properties, ProtocolError, ProtocolVersion, QoS, ReasonCode, varint};

/// Encodes packets for one connection, reusing an internal scratch buffer
/// for the body so that steady-state encoding doesn't allocate.
#[derive(Debug)]
pub struct Encoder {
    version: ProtocolVersion,
    max_packet_size: usize,
    scratch: BytesMut,
}

impl Encoder {
    pub fn new(version: ProtocolVersion, max_packet_size: usize) -> Self {
        Self {
            version,
            max_packet_size,
            scratch: BytesMut::with_capacity(256),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Lowers the size limit, e.g. to the client's Maximum Packet Size.
    pub fn set_max_packet_size(&mut self, max: usize) {
        self.max_packet_size = max;
    }

    /// Appends `packet` to `out`. See [`encode`] for the return value.
    pub fn encode(&mut self, packet: &Packet, out: &mut BytesMut) -> Result<usize, ProtocolError> {
        self.scratch.clear();
        encode_with(packet, self.version, self.max_packet_size, &mut self.scratch, out)
    }
}

/// Appends `packet` to `out` as `version` would put it on the wire.
///
/// Returns the number of bytes written. When the encoded packet would be
/// larger than `max_size`, nothing is written and `Ok(0)` is returned;
/// the caller decides whether that means "drop" or "fail".
pub fn encode(
    packet: &Packet,
    version: ProtocolVersion,
    max_size: usize,
    out: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    let mut scratch = BytesMut::new();
    encode_with(packet, version, max_size, &mut scratch, out)
}

fn encode_with(
    packet: &Packet,
    version: ProtocolVersion,
    max_size: usize,
    body: &mut BytesMut,
    out: &mut BytesMut,
) -> Result<usize, ProtocolError> {
    let first = encode_body(packet, version, body)?;
    let remaining = u32::try_from(body.len())
        .map_err(|_| ProtocolError::VarintOverflow(u32::MAX))?;
    let total = 1 + varint::encoded_len(remaining) + body.len();
    if total > max_size {
        return Ok(0);
    }
    out.reserve(total);
    out.put_u8(first);
    varint::encode(remaining, out)?;
    out.put_slice(body);
    Ok(total)
}

/// Writes the variable header and payload into `body`, returning the
/// first fixed-header byte.
fn encode_body(
    packet: &Packet,
    version: ProtocolVersion,
    body: &mut BytesMut,
) -> Result<u8, ProtocolError> {
    let v5 = version.is_v5();
    let type_bits = (packet.packet_type() as u8) << 4;

    match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, body)?;
            Ok(type_bits)
        }
        Packet::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            if v5 {
                body.put_u8(connack.reason_code.0);
                connack.properties.encode(body)?;
            } else {
                body.put_u8(connack.reason_code.connack_v3_return_code());
            }
            Ok(type_bits)
        }
        Packet::Publish(publish) => {
            encode_publish(publish, v5, body)?;
            Ok(type_bits | publish_flags(publish))
        }
        Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubComp(ack) => {
            encode_ack(ack, v5, body)?;
            Ok(type_bits)
        }
        Packet::PubRel(ack) => {
            encode_ack(ack, v5, body)?;
            Ok(type_bits | 0b0010)
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            if v5 {
                subscribe.properties.encode(body)?;
            }
            for entry in &subscribe.filters {
                write_binary(body, &entry.filter)?;
                let options = if v5 {
                    entry.options.to_byte()
                } else {
                    entry.options.qos.as_u8()
                };
                body.put_u8(options);
            }
            Ok(type_bits | 0b0010)
        }
        Packet::SubAck(suback) => {
            body.put_u16(suback.packet_id);
            if v5 {
                suback.properties.encode(body)?;
            }
            for code in &suback.reason_codes {
                body.put_u8(code.0);
            }
            Ok(type_bits)
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            if v5 {
                unsubscribe.properties.encode(body)?;
            }
            for filter in &unsubscribe.filters {
                write_binary(body, filter)?;
            }
            Ok(type_bits | 0b0010)
        }
        Packet::UnsubAck(unsuback) => {
            body.put_u16(unsuback.packet_id);
            if v5 {
                unsuback.properties.encode(body)?;
                for code in &unsuback.reason_codes {
                    body.put_u8(code.0);
                }
            }
            Ok(type_bits)
        }
        Packet::PingReq | Packet::PingResp => Ok(type_bits),
        Packet::Disconnect(disconnect) => {
            if v5 {
                encode_reason_and_properties(disconnect.reason_code, &disconnect.properties, body)?;
            }
            Ok(type_bits)
        }
        Packet::Auth(auth) => {
            if !v5 {
                return Err(ProtocolError::violation("AUTH requires MQTT 5"));
            }
            encode_reason_and_properties(auth.reason_code, &auth.properties, body)?;
            Ok(type_bits)
        }
    }
}

fn publish_flags(publish: &Publish) -> u8 {
    let dup = publish.dup && publish.qos != QoS::AtMostOnce;
    (u8::from(dup) << 3) | (publish.qos.as_u8() << 1) | u8::from(publish.retain)
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    let version = connect.protocol_version;
    let v5 = version.is_v5();

    write_string(body, version.protocol_name())?;
    body.put_u8(version.level());

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0b0000_0010;
    }
    if let Some(will) = &connect.will {
        flags |= 0b0000_0100 | (will.qos.as_u8() << 3);
        if will.retain {
            flags |= 0b0010_0000;
        }
    }
    if connect.password.is_some() {
        flags |= 0b0100_0000;
    }
    if connect.username.is_some() {
        flags |= 0b1000_0000;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    if v5 {
        connect.properties.encode(body)?;
    }

    write_string(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        if v5 {
            will.properties.encode(body)?;
        }
        write_binary(body, &will.topic)?;
        write_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        write_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        write_binary(body, password)?;
    }
    Ok(())
}

fn encode_publish(publish: &Publish, v5: bool, body: &mut BytesMut) -> Result<(), ProtocolError> {
    write_binary(body, &publish.topic)?;
    if publish.qos != QoS::AtMostOnce {
        body.put_u16(publish.packet_id);
    }
    if v5 {
        publish.properties.encode(body)?;
    }
    body.put_slice(&publish.payload);
    Ok(())
}

fn encode_ack(ack: &Ack, v5: bool, body: &mut BytesMut) -> Result<(), ProtocolError> {
    body.put_u16(ack.packet_id);
    if v5 {
        encode_reason_and_properties(ack.reason_code, &ack.properties, body)?;
    }
    Ok(())
}

/// Uses the short forms: nothing for "success without properties", the
/// reason byte alone when there are no properties.
fn encode_reason_and_properties(
    reason_code: ReasonCode,
    properties: &Properties,
    body: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let has_properties = !properties.is_empty();
    if reason_code == ReasonCode::SUCCESS && !has_properties {
        return Ok(());
    }
    body.put_u8(reason_code.0);
    if has_properties {
        properties.encode(body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packet::{ConnAck, Disconnect, SubAck, UnsubAck};

    fn encode_v(packet: &Packet, version: ProtocolVersion) -> BytesMut {
        let mut out = BytesMut::new();
        let written = encode(packet, version, usize::MAX, &mut out).unwrap();
        assert_eq!(written, out.len());
        out
    }

    fn publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: false,
            topic: Bytes::from_static(b"a/b"),
            packet_id: if qos == QoS::AtMostOnce { 0 } else { 10 },
            payload: Bytes::from_static(b"hi"),
            properties: Properties::default(),
        }
    }

    #[test]
    fn test_encode_publish_qos1_v311_layout() {
        let out = encode_v(&Packet::Publish(publish(QoS::AtLeastOnce)), ProtocolVersion::V3_1_1);
        assert_eq!(
            &out[..],
            &[0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
        );
    }

    #[test]
    fn test_encode_publish_v5_writes_empty_property_block() {
        let out = encode_v(&Packet::Publish(publish(QoS::AtMostOnce)), ProtocolVersion::V5);
        assert_eq!(&out[..], &[0x30, 0x08, 0x00, 0x03, b'a', b'/', b'b', 0x00, b'h', b'i']);
    }

    #[test]
    fn test_encode_over_max_size_writes_nothing() {
        let mut out = BytesMut::new();
        let packet = Packet::Publish(publish(QoS::AtLeastOnce));
        assert_eq!(encode(&packet, ProtocolVersion::V3_1_1, 10, &mut out).unwrap(), 0);
        assert!(out.is_empty());
        assert_eq!(encode(&packet, ProtocolVersion::V3_1_1, 11, &mut out).unwrap(), 11);
    }

    #[test]
    fn test_encode_connack_v3_maps_reason_code() {
        let packet = Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code: ReasonCode::BAD_USER_NAME_OR_PASSWORD,
            properties: Properties::default(),
        });
        assert_eq!(&encode_v(&packet, ProtocolVersion::V3_1_1)[..], &[0x20, 0x02, 0x00, 0x04]);
        assert_eq!(
            &encode_v(&packet, ProtocolVersion::V5)[..],
            &[0x20, 0x03, 0x00, 0x86, 0x00]
        );
    }

    #[test]
    fn test_encode_ack_v5_uses_short_form() {
        assert_eq!(
            &encode_v(&Packet::PubAck(Ack::new(5)), ProtocolVersion::V5)[..],
            &[0x40, 0x02, 0x00, 0x05]
        );
        let rec = Ack {
            reason_code: ReasonCode::NO_MATCHING_SUBSCRIBERS,
            ..Ack::new(5)
        };
        assert_eq!(
            &encode_v(&Packet::PubRec(rec), ProtocolVersion::V5)[..],
            &[0x50, 0x03, 0x00, 0x05, 0x10]
        );
    }

    #[test]
    fn test_encode_pubrel_sets_reserved_flag() {
        let out = encode_v(&Packet::PubRel(Ack::new(1)), ProtocolVersion::V3_1_1);
        assert_eq!(&out[..], &[0x62, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_encode_unsuback_v3_omits_reason_codes() {
        let packet = Packet::UnsubAck(UnsubAck {
            packet_id: 3,
            reason_codes: vec![ReasonCode::SUCCESS],
            properties: Properties::default(),
        });
        assert_eq!(&encode_v(&packet, ProtocolVersion::V3_1_1)[..], &[0xB0, 0x02, 0x00, 0x03]);
        assert_eq!(
            &encode_v(&packet, ProtocolVersion::V5)[..],
            &[0xB0, 0x04, 0x00, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_suback_and_disconnect() {
        let suback = Packet::SubAck(SubAck {
            packet_id: 1,
            reason_codes: vec![ReasonCode::GRANTED_QOS_1, ReasonCode::UNSPECIFIED_ERROR],
            properties: Properties::default(),
        });
        assert_eq!(
            &encode_v(&suback, ProtocolVersion::V3_1_1)[..],
            &[0x90, 0x04, 0x00, 0x01, 0x01, 0x80]
        );
        let disconnect = Packet::Disconnect(Disconnect {
            reason_code: ReasonCode::SESSION_TAKEN_OVER,
            properties: Properties::default(),
        });
        assert_eq!(&encode_v(&disconnect, ProtocolVersion::V5)[..], &[0xE0, 0x01, 0x8E]);
        assert_eq!(&encode_v(&disconnect, ProtocolVersion::V3_1_1)[..], &[0xE0, 0x00]);
    }

    #[test]
    fn test_encoder_reuses_scratch_across_packets() {
        let mut encoder = Encoder::new(ProtocolVersion::V3_1_1, usize::MAX);
        let mut out = BytesMut::new();
        encoder.encode(&Packet::PingResp, &mut out).unwrap();
        encoder.encode(&Packet::PubAck(Ack::new(9)), &mut out).unwrap();
        assert_eq!(&out[..], &[0xD0, 0x00, 0x40, 0x02, 0x00, 0x09]);
    }
}
