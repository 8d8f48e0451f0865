//! Body decoding, one function per packet type.

use bytes::{Buf, Bytes};

use super::FixedHeader;
use super::primitives::{read_binary, read_string, read_u16, read_u8, read_utf8_bytes};
use crate::packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, Publish, RetainHandling, SubAck, Subscribe,
    SubscribeFilter, SubscriptionOptions, UnsubAck, Unsubscribe, Will,
};
use crate::{PacketType, Properties, ProtocolError, ProtocolVersion, QoS, ReasonCode};

/// Decodes the body of one complete frame.
///
/// `body` must be exactly `header.remaining_length` bytes. `version` is
/// the protocol negotiated on this connection; CONNECT ignores it and
/// reads its own protocol level instead. Any bytes left over after the
/// last field make the packet malformed.
pub fn decode_packet(
    header: &FixedHeader,
    mut body: Bytes,
    version: ProtocolVersion,
) -> Result<Packet, ProtocolError> {
    if body.len() != header.remaining_length as usize {
        return Err(ProtocolError::malformed(format!(
            "body is {} bytes, header says {}",
            body.len(),
            header.remaining_length
        )));
    }

    let v5 = version.is_v5();
    let buf = &mut body;
    let packet = match header.packet_type {
        PacketType::Connect => Packet::Connect(Box::new(decode_connect(buf)?)),
        PacketType::ConnAck => Packet::ConnAck(decode_connack(buf, v5)?),
        PacketType::Publish => Packet::Publish(decode_publish(header.flags, buf, v5)?),
        PacketType::PubAck => Packet::PubAck(decode_ack(buf, v5)?),
        PacketType::PubRec => Packet::PubRec(decode_ack(buf, v5)?),
        PacketType::PubRel => Packet::PubRel(decode_ack(buf, v5)?),
        PacketType::PubComp => Packet::PubComp(decode_ack(buf, v5)?),
        PacketType::Subscribe => Packet::Subscribe(decode_subscribe(buf, v5)?),
        PacketType::SubAck => Packet::SubAck(decode_suback(buf, v5)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(buf, v5)?),
        PacketType::UnsubAck => Packet::UnsubAck(decode_unsuback(buf, v5)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => {
            let (reason_code, properties) = decode_reason_and_properties(buf, v5)?;
            Packet::Disconnect(Disconnect {
                reason_code,
                properties,
            })
        }
        PacketType::Auth => {
            if !v5 {
                return Err(ProtocolError::violation("AUTH requires MQTT 5"));
            }
            let (reason_code, properties) = decode_reason_and_properties(buf, v5)?;
            Packet::Auth(Auth {
                reason_code,
                properties,
            })
        }
    };

    if !body.is_empty() {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after {}",
            body.len(),
            header.packet_type
        )));
    }
    Ok(packet)
}

fn read_packet_id(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    let id = read_u16(buf, "packet identifier")?;
    if id == 0 {
        return Err(ProtocolError::malformed("packet identifier 0"));
    }
    Ok(id)
}

fn read_properties(buf: &mut Bytes, v5: bool) -> Result<Properties, ProtocolError> {
    if v5 {
        Properties::decode(buf)
    } else {
        Ok(Properties::default())
    }
}

fn decode_connect(buf: &mut Bytes) -> Result<Connect, ProtocolError> {
    let name = read_string(buf, "protocol name")?;
    let level = read_u8(buf, "protocol level")?;
    let protocol_version = ProtocolVersion::from_level(level)
        .ok_or(ProtocolError::UnsupportedProtocolVersion(level))?;
    if name != protocol_version.protocol_name() {
        return Err(ProtocolError::InvalidProtocolName(name));
    }
    let v5 = protocol_version.is_v5();

    let flags = read_u8(buf, "connect flags")?;
    if flags & 0b0000_0001 != 0 {
        return Err(ProtocolError::malformed("reserved connect flag set"));
    }
    let clean_start = flags & 0b0000_0010 != 0;
    let will_flag = flags & 0b0000_0100 != 0;
    let will_qos_bits = (flags >> 3) & 0b11;
    let will_retain = flags & 0b0010_0000 != 0;
    let has_password = flags & 0b0100_0000 != 0;
    let has_username = flags & 0b1000_0000 != 0;

    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(ProtocolError::malformed("will QoS or retain without will flag"));
    }
    let will_qos = QoS::try_from(will_qos_bits)?;
    if !v5 && has_password && !has_username {
        return Err(ProtocolError::malformed("password without username"));
    }

    let keep_alive = read_u16(buf, "keep alive")?;
    let properties = read_properties(buf, v5)?;
    let client_id = read_string(buf, "client identifier")?;

    let will = if will_flag {
        let properties = read_properties(buf, v5)?;
        let topic = read_utf8_bytes(buf, "will topic")?;
        let payload = read_binary(buf, "will payload")?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties,
        })
    } else {
        None
    };

    let username = if has_username {
        Some(read_string(buf, "username")?)
    } else {
        None
    };
    let password = if has_password {
        Some(read_binary(buf, "password")?)
    } else {
        None
    };

    Ok(Connect {
        protocol_version,
        client_id,
        clean_start,
        keep_alive,
        username,
        password,
        will,
        properties,
    })
}

fn decode_connack(buf: &mut Bytes, v5: bool) -> Result<ConnAck, ProtocolError> {
    let ack_flags = read_u8(buf, "connack flags")?;
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::malformed("reserved connack flags set"));
    }
    let code = read_u8(buf, "connack code")?;
    let reason_code = if v5 {
        ReasonCode(code)
    } else {
        ReasonCode::from_connack_v3_return_code(code)
    };
    Ok(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        reason_code,
        properties: read_properties(buf, v5)?,
    })
}

fn decode_publish(flags: u8, buf: &mut Bytes, v5: bool) -> Result<Publish, ProtocolError> {
    let qos = QoS::try_from((flags >> 1) & 0b11)?;
    let topic = read_utf8_bytes(buf, "topic name")?;
    let packet_id = if qos == QoS::AtMostOnce {
        0
    } else {
        read_packet_id(buf)?
    };
    let properties = read_properties(buf, v5)?;
    if topic.is_empty() && properties.topic_alias.is_none() {
        return Err(ProtocolError::malformed("empty topic name"));
    }
    // The rest of the frame is the payload.
    let payload = buf.split_to(buf.len());
    Ok(Publish {
        dup: flags & 0b1000 != 0,
        qos,
        retain: flags & 0b0001 != 0,
        topic,
        packet_id,
        payload,
        properties,
    })
}

fn decode_ack(buf: &mut Bytes, v5: bool) -> Result<Ack, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let (reason_code, properties) = decode_reason_and_properties(buf, v5)?;
    Ok(Ack {
        packet_id,
        reason_code,
        properties,
    })
}

/// The optional reason-code-then-properties tail shared by the 5.0 acks,
/// DISCONNECT and AUTH. Both parts may be omitted on the wire, meaning
/// "success, no properties".
fn decode_reason_and_properties(
    buf: &mut Bytes,
    v5: bool,
) -> Result<(ReasonCode, Properties), ProtocolError> {
    if !v5 || !buf.has_remaining() {
        return Ok((ReasonCode::SUCCESS, Properties::default()));
    }
    let reason_code = ReasonCode(buf.get_u8());
    let properties = if buf.has_remaining() {
        Properties::decode(buf)?
    } else {
        Properties::default()
    };
    Ok((reason_code, properties))
}

fn decode_subscribe(buf: &mut Bytes, v5: bool) -> Result<Subscribe, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let properties = read_properties(buf, v5)?;
    if properties.subscription_identifiers.len() > 1 {
        return Err(ProtocolError::violation("more than one subscription identifier"));
    }

    let mut filters = Vec::new();
    while buf.has_remaining() {
        let filter = read_utf8_bytes(buf, "topic filter")?;
        let byte = read_u8(buf, "subscription options")?;
        let reserved = if v5 { 0b1100_0000 } else { 0b1111_1100 };
        if byte & reserved != 0 {
            return Err(ProtocolError::malformed("reserved subscription option bits set"));
        }
        let qos = QoS::try_from(byte & 0b11)?;
        let retain_handling = RetainHandling::from_bits((byte >> 4) & 0b11)
            .ok_or_else(|| ProtocolError::malformed("retain handling 3"))?;
        filters.push(SubscribeFilter {
            filter,
            options: SubscriptionOptions {
                qos,
                no_local: byte & 0b0100 != 0,
                retain_as_published: byte & 0b1000 != 0,
                retain_handling,
            },
        });
    }
    if filters.is_empty() {
        return Err(ProtocolError::malformed("SUBSCRIBE without filters"));
    }

    Ok(Subscribe {
        packet_id,
        filters,
        properties,
    })
}

fn decode_suback(buf: &mut Bytes, v5: bool) -> Result<SubAck, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let properties = read_properties(buf, v5)?;
    let reason_codes = buf.split_to(buf.len()).iter().map(|&b| ReasonCode(b)).collect();
    Ok(SubAck {
        packet_id,
        reason_codes,
        properties,
    })
}

fn decode_unsubscribe(buf: &mut Bytes, v5: bool) -> Result<Unsubscribe, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let properties = read_properties(buf, v5)?;
    let mut filters = Vec::new();
    while buf.has_remaining() {
        filters.push(read_utf8_bytes(buf, "topic filter")?);
    }
    if filters.is_empty() {
        return Err(ProtocolError::malformed("UNSUBSCRIBE without filters"));
    }
    Ok(Unsubscribe {
        packet_id,
        filters,
        properties,
    })
}

fn decode_unsuback(buf: &mut Bytes, v5: bool) -> Result<UnsubAck, ProtocolError> {
    let packet_id = read_packet_id(buf)?;
    let properties = read_properties(buf, v5)?;
    let reason_codes = if v5 {
        buf.split_to(buf.len()).iter().map(|&b| ReasonCode(b)).collect()
    } else {
        Vec::new()
    };
    Ok(UnsubAck {
        packet_id,
        reason_codes,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_header;

    fn decode(frame: &'static [u8], version: ProtocolVersion) -> Result<Packet, ProtocolError> {
        let header = decode_header(frame)?.expect("complete header");
        let body = Bytes::from_static(frame).slice(header.header_len..);
        decode_packet(&header, body, version)
    }

    const CONNECT_V311: &[u8] = &[
        0x10, 0x16, // CONNECT, remaining 22
        0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, // name + level
        0xC2, // username, password, clean
        0x00, 0x3C, // keep alive 60
        0x00, 0x03, b'c', b'i', b'd', // client id
        0x00, 0x01, b'u', // username
        0x00, 0x02, b'p', b'w', // password
    ];

    #[test]
    fn test_decode_connect_v311_reads_all_fields() {
        let Packet::Connect(connect) = decode(CONNECT_V311, ProtocolVersion::V3_1_1).unwrap() else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.protocol_version, ProtocolVersion::V3_1_1);
        assert_eq!(connect.client_id, "cid");
        assert!(connect.clean_start);
        assert_eq!(connect.keep_alive, 60);
        assert_eq!(connect.username.as_deref(), Some("u"));
        assert_eq!(connect.password.as_deref(), Some(&b"pw"[..]));
        assert!(connect.will.is_none());
    }

    #[test]
    fn test_decode_connect_uses_own_level_not_connection_version() {
        let Packet::Connect(connect) = decode(CONNECT_V311, ProtocolVersion::V5).unwrap() else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.protocol_version, ProtocolVersion::V3_1_1);
    }

    #[test]
    fn test_decode_connect_name_level_mismatch_is_rejected() {
        const FRAME: &[u8] = &[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x00, 0x00, 0x01,
            b'c',
        ];
        assert!(matches!(
            decode(FRAME, ProtocolVersion::V3_1_1),
            Err(ProtocolError::InvalidProtocolName(_))
        ));
    }

    #[test]
    fn test_decode_connect_unsupported_level() {
        const FRAME: &[u8] = &[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x07, 0x02, 0x00, 0x00, 0x00, 0x01,
            b'c',
        ];
        assert!(matches!(
            decode(FRAME, ProtocolVersion::V3_1_1),
            Err(ProtocolError::UnsupportedProtocolVersion(7))
        ));
    }

    #[test]
    fn test_decode_connect_reserved_flag_is_malformed() {
        const FRAME: &[u8] = &[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x00, 0x00, 0x01,
            b'c',
        ];
        assert!(matches!(
            decode(FRAME, ProtocolVersion::V3_1_1),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_connect_password_without_username_v311_is_malformed() {
        const FRAME: &[u8] = &[
            0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x00, 0x00, 0x01,
            b'c', 0x00, 0x01, b'p',
        ];
        assert!(decode(FRAME, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_decode_connect_with_will() {
        const FRAME: &[u8] = &[
            0x10, 0x17, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04,
            0x2E, // will retain, will qos 1, will flag, clean
            0x00, 0x0A, 0x00, 0x01, b'c', // client id
            0x00, 0x03, b'w', b'/', b't', // will topic
            0x00, 0x03, b'b', b'y', b'e', // will payload
        ];
        let Packet::Connect(connect) = decode(FRAME, ProtocolVersion::V3_1_1).unwrap() else {
            panic!("expected CONNECT");
        };
        let will = connect.will.expect("will");
        assert_eq!(&will.topic[..], b"w/t");
        assert_eq!(&will.payload[..], b"bye");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_decode_publish_qos1_v5_with_properties() {
        const FRAME: &[u8] = &[
            0x32, 0x0C, // PUBLISH QoS1
            0x00, 0x03, b'a', b'/', b'b', // topic
            0x00, 0x07, // packet id
            0x03, 0x23, 0x00, 0x02, // properties: topic alias 2
            b'x', // payload
        ];
        let Packet::Publish(publish) = decode(FRAME, ProtocolVersion::V5).unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(&publish.topic[..], b"a/b");
        assert_eq!(publish.packet_id, 7);
        assert_eq!(publish.properties.topic_alias, Some(2));
        assert_eq!(&publish.payload[..], b"x");
    }

    #[test]
    fn test_decode_publish_zero_packet_id_is_malformed() {
        const FRAME: &[u8] = &[0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
        assert!(decode(FRAME, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_decode_publish_qos0_payload_is_rest_of_frame() {
        const FRAME: &[u8] = &[0x30, 0x05, 0x00, 0x01, b't', b'h', b'i'];
        let Packet::Publish(publish) = decode(FRAME, ProtocolVersion::V3_1_1).unwrap() else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.packet_id, 0);
        assert_eq!(&publish.payload[..], b"hi");
    }

    #[test]
    fn test_decode_ack_v5_short_forms() {
        const BARE: &[u8] = &[0x40, 0x02, 0x00, 0x05];
        const REASON_ONLY: &[u8] = &[0x40, 0x03, 0x00, 0x05, 0x10];
        let Packet::PubAck(ack) = decode(BARE, ProtocolVersion::V5).unwrap() else {
            panic!("expected PUBACK");
        };
        assert_eq!(ack.reason_code, ReasonCode::SUCCESS);
        let Packet::PubAck(ack) = decode(REASON_ONLY, ProtocolVersion::V5).unwrap() else {
            panic!("expected PUBACK");
        };
        assert_eq!(ack.reason_code, ReasonCode::NO_MATCHING_SUBSCRIBERS);
    }

    #[test]
    fn test_decode_ack_v3_trailing_bytes_are_malformed() {
        const FRAME: &[u8] = &[0x40, 0x03, 0x00, 0x05, 0x10];
        assert!(matches!(
            decode(FRAME, ProtocolVersion::V3_1_1),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_subscribe_reads_filters_and_options() {
        const FRAME: &[u8] = &[
            0x82, 0x0D, 0x00, 0x01, // packet id 1
            0x00, // properties
            0x00, 0x03, b'a', b'/', b'+', 0x2D, // qos1, no-local, rap, rh=2
            0x00, 0x01, b'#', 0x00,
        ];
        let Packet::Subscribe(subscribe) = decode(FRAME, ProtocolVersion::V5).unwrap() else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.filters.len(), 2);
        let first = &subscribe.filters[0];
        assert_eq!(&first.filter[..], b"a/+");
        assert_eq!(first.options.qos, QoS::AtLeastOnce);
        assert!(first.options.no_local);
        assert!(first.options.retain_as_published);
        assert_eq!(first.options.retain_handling, RetainHandling::DoNotSend);
    }

    #[test]
    fn test_decode_subscribe_v3_option_bits_are_reserved() {
        const FRAME: &[u8] = &[0x82, 0x06, 0x00, 0x01, 0x00, 0x01, b'#', 0x04];
        assert!(decode(FRAME, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_decode_subscribe_empty_list_is_malformed() {
        const FRAME: &[u8] = &[0x82, 0x02, 0x00, 0x01];
        assert!(decode(FRAME, ProtocolVersion::V3_1_1).is_err());
    }

    #[test]
    fn test_decode_auth_in_v3_is_violation() {
        const FRAME: &[u8] = &[0xF0, 0x00];
        assert!(matches!(
            decode(FRAME, ProtocolVersion::V3_1_1),
            Err(ProtocolError::Violation(_))
        ));
    }

    #[test]
    fn test_decode_disconnect_v5_reason_code() {
        const FRAME: &[u8] = &[0xE0, 0x01, 0x04];
        let Packet::Disconnect(disconnect) = decode(FRAME, ProtocolVersion::V5).unwrap() else {
            panic!("expected DISCONNECT");
        };
        assert_eq!(disconnect.reason_code, ReasonCode::DISCONNECT_WITH_WILL);
    }

    #[test]
    fn test_decode_pingreq_with_body_is_malformed() {
        const FRAME: &[u8] = &[0xC0, 0x01, 0x00];
        assert!(decode(FRAME, ProtocolVersion::V3_1_1).is_err());
    }
}
