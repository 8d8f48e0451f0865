//! Error types for the protocol layer.
//!
//! Each crate in relaymq defines its own error enum. A `ProtocolError`
//! always means the bytes on the wire were wrong, never that a socket or
//! a session misbehaved. Every variant is fatal for the connection that
//! produced it.

use crate::ReasonCode;

/// Errors that can occur while decoding or encoding MQTT packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The payload of a recognized packet type is structurally invalid:
    /// truncated fields, bad flags, invalid UTF-8, trailing bytes, etc.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The packet is well-formed but not allowed here (wrong ordering,
    /// unexpected direction, feature not available in this version).
    #[error("protocol violation: {0}")]
    Violation(String),

    /// The control packet type nibble is reserved.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    /// The remaining-length field used a fifth continuation byte.
    #[error("remaining length uses more than 4 bytes")]
    InvalidRemainingLength,

    /// A value is too large for the variable byte integer encoding.
    #[error("value {0} exceeds the variable byte integer range")]
    VarintOverflow(u32),

    /// The packet is larger than the negotiated maximum.
    #[error("packet of {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// The CONNECT packet requested a protocol level we don't speak.
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolVersion(u8),

    /// The CONNECT protocol name doesn't match its protocol level.
    #[error("invalid protocol name {0:?}")]
    InvalidProtocolName(String),
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::Malformed`].
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Shorthand for [`ProtocolError::Violation`].
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::Violation(msg.into())
    }

    /// The MQTT 5 reason code sent in a DISCONNECT (or CONNACK) when this
    /// error closes a connection.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Malformed(_) | Self::InvalidRemainingLength | Self::VarintOverflow(_) => {
                ReasonCode::MALFORMED_PACKET
            }
            Self::Violation(_) | Self::UnknownPacketType(_) => ReasonCode::PROTOCOL_ERROR,
            Self::PacketTooLarge { .. } => ReasonCode::PACKET_TOO_LARGE,
            Self::UnsupportedProtocolVersion(_) | Self::InvalidProtocolName(_) => {
                ReasonCode::UNSUPPORTED_PROTOCOL_VERSION
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_malformed_maps_to_0x81() {
        let err = ProtocolError::malformed("truncated");
        assert_eq!(err.reason_code(), ReasonCode::MALFORMED_PACKET);
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_reason_code_unknown_type_is_protocol_error() {
        assert_eq!(
            ProtocolError::UnknownPacketType(0).reason_code(),
            ReasonCode::PROTOCOL_ERROR
        );
    }

    #[test]
    fn test_reason_code_too_large_maps_to_0x95() {
        let err = ProtocolError::PacketTooLarge { size: 10, max: 5 };
        assert_eq!(err.reason_code(), ReasonCode::PACKET_TOO_LARGE);
    }
}
