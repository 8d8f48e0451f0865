//! MQTT 5 properties.
//!
//! Every 5.0 packet carries a properties block: a variable byte integer
//! length followed by `(identifier, value)` pairs. A single struct holds
//! the union of all properties; each packet codec only reads or writes
//! the ones that make sense for it, and the wire never carries the
//! `None`/empty ones.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::primitives::{
    read_binary, read_string, read_u16, read_u32, read_u8, read_varint, write_binary,
    write_string,
};
use crate::{ProtocolError, varint};

/// Property identifiers from the MQTT 5 property registry.
mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// The union of all MQTT 5 properties.
///
/// `Default` is the empty block (encodes as a single `0x00` length byte).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// PUBLISH may carry several; SUBSCRIBE carries at most one.
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

/// Stores `value` into `slot`, rejecting a second occurrence.
fn set_once<T>(slot: &mut Option<T>, value: T, name: &str) -> Result<(), ProtocolError> {
    if slot.is_some() {
        return Err(ProtocolError::malformed(format!("duplicate {name} property")));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    /// `true` when no property is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Reads a properties block (length prefix included) from `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let len = read_varint(buf, "property length")? as usize;
        if buf.len() < len {
            return Err(ProtocolError::malformed("property length exceeds packet"));
        }
        let mut block = buf.split_to(len);
        let mut props = Self::default();

        while !block.is_empty() {
            let ident = read_varint(&mut block, "property identifier")?;
            let ident = u8::try_from(ident)
                .map_err(|_| ProtocolError::malformed(format!("unknown property {ident:#x}")))?;
            let b = &mut block;
            match ident {
                id::PAYLOAD_FORMAT_INDICATOR => {
                    let v = read_u8(b, "payload format indicator")?;
                    if v > 1 {
                        return Err(ProtocolError::malformed("payload format indicator > 1"));
                    }
                    set_once(&mut props.payload_format_indicator, v, "payload format")?
                }
                id::MESSAGE_EXPIRY_INTERVAL => set_once(
                    &mut props.message_expiry_interval,
                    read_u32(b, "message expiry")?,
                    "message expiry",
                )?,
                id::CONTENT_TYPE => set_once(
                    &mut props.content_type,
                    read_string(b, "content type")?,
                    "content type",
                )?,
                id::RESPONSE_TOPIC => set_once(
                    &mut props.response_topic,
                    read_string(b, "response topic")?,
                    "response topic",
                )?,
                id::CORRELATION_DATA => set_once(
                    &mut props.correlation_data,
                    read_binary(b, "correlation data")?,
                    "correlation data",
                )?,
                id::SUBSCRIPTION_IDENTIFIER => {
                    let v = read_varint(b, "subscription identifier")?;
                    if v == 0 {
                        return Err(ProtocolError::malformed("subscription identifier 0"));
                    }
                    props.subscription_identifiers.push(v);
                }
                id::SESSION_EXPIRY_INTERVAL => set_once(
                    &mut props.session_expiry_interval,
                    read_u32(b, "session expiry")?,
                    "session expiry",
                )?,
                id::ASSIGNED_CLIENT_IDENTIFIER => set_once(
                    &mut props.assigned_client_identifier,
                    read_string(b, "assigned client identifier")?,
                    "assigned client identifier",
                )?,
                id::SERVER_KEEP_ALIVE => set_once(
                    &mut props.server_keep_alive,
                    read_u16(b, "server keep alive")?,
                    "server keep alive",
                )?,
                id::AUTHENTICATION_METHOD => set_once(
                    &mut props.authentication_method,
                    read_string(b, "authentication method")?,
                    "authentication method",
                )?,
                id::AUTHENTICATION_DATA => set_once(
                    &mut props.authentication_data,
                    read_binary(b, "authentication data")?,
                    "authentication data",
                )?,
                id::REQUEST_PROBLEM_INFORMATION => set_once(
                    &mut props.request_problem_information,
                    read_u8(b, "request problem information")?,
                    "request problem information",
                )?,
                id::WILL_DELAY_INTERVAL => set_once(
                    &mut props.will_delay_interval,
                    read_u32(b, "will delay")?,
                    "will delay",
                )?,
                id::REQUEST_RESPONSE_INFORMATION => set_once(
                    &mut props.request_response_information,
                    read_u8(b, "request response information")?,
                    "request response information",
                )?,
                id::RESPONSE_INFORMATION => set_once(
                    &mut props.response_information,
                    read_string(b, "response information")?,
                    "response information",
                )?,
                id::SERVER_REFERENCE => set_once(
                    &mut props.server_reference,
                    read_string(b, "server reference")?,
                    "server reference",
                )?,
                id::REASON_STRING => set_once(
                    &mut props.reason_string,
                    read_string(b, "reason string")?,
                    "reason string",
                )?,
                id::RECEIVE_MAXIMUM => {
                    let v = read_u16(b, "receive maximum")?;
                    if v == 0 {
                        return Err(ProtocolError::malformed("receive maximum 0"));
                    }
                    set_once(&mut props.receive_maximum, v, "receive maximum")?
                }
                id::TOPIC_ALIAS_MAXIMUM => set_once(
                    &mut props.topic_alias_maximum,
                    read_u16(b, "topic alias maximum")?,
                    "topic alias maximum",
                )?,
                id::TOPIC_ALIAS => set_once(
                    &mut props.topic_alias,
                    read_u16(b, "topic alias")?,
                    "topic alias",
                )?,
                id::MAXIMUM_QOS => set_once(
                    &mut props.maximum_qos,
                    read_u8(b, "maximum qos")?,
                    "maximum qos",
                )?,
                id::RETAIN_AVAILABLE => set_once(
                    &mut props.retain_available,
                    read_u8(b, "retain available")?,
                    "retain available",
                )?,
                id::USER_PROPERTY => {
                    let key = read_string(b, "user property key")?;
                    let value = read_string(b, "user property value")?;
                    props.user_properties.push((key, value));
                }
                id::MAXIMUM_PACKET_SIZE => {
                    let v = read_u32(b, "maximum packet size")?;
                    if v == 0 {
                        return Err(ProtocolError::malformed("maximum packet size 0"));
                    }
                    set_once(&mut props.maximum_packet_size, v, "maximum packet size")?
                }
                id::WILDCARD_SUBSCRIPTION_AVAILABLE => set_once(
                    &mut props.wildcard_subscription_available,
                    read_u8(b, "wildcard subscription available")?,
                    "wildcard subscription available",
                )?,
                id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => set_once(
                    &mut props.subscription_identifier_available,
                    read_u8(b, "subscription identifier available")?,
                    "subscription identifier available",
                )?,
                id::SHARED_SUBSCRIPTION_AVAILABLE => set_once(
                    &mut props.shared_subscription_available,
                    read_u8(b, "shared subscription available")?,
                    "shared subscription available",
                )?,
                other => {
                    return Err(ProtocolError::malformed(format!(
                        "unknown property {other:#x}"
                    )));
                }
            }
        }

        Ok(props)
    }

    /// Length of the property pairs, excluding the length prefix.
    pub fn body_len(&self) -> usize {
        fn string(s: &Option<String>) -> usize {
            s.as_ref().map_or(0, |s| 1 + 2 + s.len())
        }
        fn binary(b: &Option<Bytes>) -> usize {
            b.as_ref().map_or(0, |b| 1 + 2 + b.len())
        }
        fn fixed<T>(v: &Option<T>, width: usize) -> usize {
            v.as_ref().map_or(0, |_| 1 + width)
        }

        fixed(&self.payload_format_indicator, 1)
            + fixed(&self.message_expiry_interval, 4)
            + string(&self.content_type)
            + string(&self.response_topic)
            + binary(&self.correlation_data)
            + self
                .subscription_identifiers
                .iter()
                .map(|id| 1 + varint::encoded_len(*id))
                .sum::<usize>()
            + fixed(&self.session_expiry_interval, 4)
            + string(&self.assigned_client_identifier)
            + fixed(&self.server_keep_alive, 2)
            + string(&self.authentication_method)
            + binary(&self.authentication_data)
            + fixed(&self.request_problem_information, 1)
            + fixed(&self.will_delay_interval, 4)
            + fixed(&self.request_response_information, 1)
            + string(&self.response_information)
            + string(&self.server_reference)
            + string(&self.reason_string)
            + fixed(&self.receive_maximum, 2)
            + fixed(&self.topic_alias_maximum, 2)
            + fixed(&self.topic_alias, 2)
            + fixed(&self.maximum_qos, 1)
            + fixed(&self.retain_available, 1)
            + self
                .user_properties
                .iter()
                .map(|(k, v)| 1 + 2 + k.len() + 2 + v.len())
                .sum::<usize>()
            + fixed(&self.maximum_packet_size, 4)
            + fixed(&self.wildcard_subscription_available, 1)
            + fixed(&self.subscription_identifier_available, 1)
            + fixed(&self.shared_subscription_available, 1)
    }

    /// Total encoded size including the length prefix.
    pub fn encoded_len(&self) -> usize {
        let body = self.body_len();
        varint::encoded_len(body as u32) + body
    }

    /// Writes the block (length prefix included) into `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = u32::try_from(self.body_len())
            .map_err(|_| ProtocolError::malformed("properties too large"))?;
        varint::encode(body, out)?;

        fn byte(out: &mut BytesMut, ident: u8, v: Option<u8>) {
            if let Some(v) = v {
                out.put_u8(ident);
                out.put_u8(v);
            }
        }
        fn short(out: &mut BytesMut, ident: u8, v: Option<u16>) {
            if let Some(v) = v {
                out.put_u8(ident);
                out.put_u16(v);
            }
        }
        fn long(out: &mut BytesMut, ident: u8, v: Option<u32>) {
            if let Some(v) = v {
                out.put_u8(ident);
                out.put_u32(v);
            }
        }
        fn string(out: &mut BytesMut, ident: u8, v: &Option<String>) -> Result<(), ProtocolError> {
            if let Some(v) = v {
                out.put_u8(ident);
                write_string(out, v)?;
            }
            Ok(())
        }
        fn binary(out: &mut BytesMut, ident: u8, v: &Option<Bytes>) -> Result<(), ProtocolError> {
            if let Some(v) = v {
                out.put_u8(ident);
                write_binary(out, v)?;
            }
            Ok(())
        }

        byte(out, id::PAYLOAD_FORMAT_INDICATOR, self.payload_format_indicator);
        long(out, id::MESSAGE_EXPIRY_INTERVAL, self.message_expiry_interval);
        string(out, id::CONTENT_TYPE, &self.content_type)?;
        string(out, id::RESPONSE_TOPIC, &self.response_topic)?;
        binary(out, id::CORRELATION_DATA, &self.correlation_data)?;
        for sub_id in &self.subscription_identifiers {
            out.put_u8(id::SUBSCRIPTION_IDENTIFIER);
            varint::encode(*sub_id, out)?;
        }
        long(out, id::SESSION_EXPIRY_INTERVAL, self.session_expiry_interval);
        string(out, id::ASSIGNED_CLIENT_IDENTIFIER, &self.assigned_client_identifier)?;
        short(out, id::SERVER_KEEP_ALIVE, self.server_keep_alive);
        string(out, id::AUTHENTICATION_METHOD, &self.authentication_method)?;
        binary(out, id::AUTHENTICATION_DATA, &self.authentication_data)?;
        byte(out, id::REQUEST_PROBLEM_INFORMATION, self.request_problem_information);
        long(out, id::WILL_DELAY_INTERVAL, self.will_delay_interval);
        byte(out, id::REQUEST_RESPONSE_INFORMATION, self.request_response_information);
        string(out, id::RESPONSE_INFORMATION, &self.response_information)?;
        string(out, id::SERVER_REFERENCE, &self.server_reference)?;
        string(out, id::REASON_STRING, &self.reason_string)?;
        short(out, id::RECEIVE_MAXIMUM, self.receive_maximum);
        short(out, id::TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum);
        short(out, id::TOPIC_ALIAS, self.topic_alias);
        byte(out, id::MAXIMUM_QOS, self.maximum_qos);
        byte(out, id::RETAIN_AVAILABLE, self.retain_available);
        for (key, value) in &self.user_properties {
            out.put_u8(id::USER_PROPERTY);
            write_string(out, key)?;
            write_string(out, value)?;
        }
        long(out, id::MAXIMUM_PACKET_SIZE, self.maximum_packet_size);
        byte(out, id::WILDCARD_SUBSCRIPTION_AVAILABLE, self.wildcard_subscription_available);
        byte(out, id::SUBSCRIPTION_IDENTIFIER_AVAILABLE, self.subscription_identifier_available);
        byte(out, id::SHARED_SUBSCRIPTION_AVAILABLE, self.shared_subscription_available);
        Ok(())
    }
}
