//! Error types for the session layer.

use relaymq_protocol::ReasonCode;

/// Errors raised while a session processes traffic.
///
/// All of them are fatal for the connection: the engine sends a
/// DISCONNECT carrying [`SessionError::reason_code`] (5.0 only) and
/// closes the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The client had more unacknowledged QoS 2 publishes outstanding
    /// than the receive maximum the broker advertised.
    #[error("receive maximum of {0} exceeded")]
    ReceiveMaximumExceeded(usize),

    /// A PUBLISH referenced a topic alias that is out of range or was
    /// never mapped on this connection.
    #[error("invalid topic alias {0}")]
    TopicAliasInvalid(u16),

    /// Every packet identifier is in flight.
    #[error("no free packet identifier")]
    PacketIdsExhausted,

    /// The in-flight window was closed while a sender waited on it.
    #[error("in-flight window closed")]
    InflightClosed,
}

impl SessionError {
    /// The reason code sent in the DISCONNECT this error triggers.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::ReceiveMaximumExceeded(_) => ReasonCode::RECEIVE_MAXIMUM_EXCEEDED,
            Self::TopicAliasInvalid(_) => ReasonCode::TOPIC_ALIAS_INVALID,
            Self::PacketIdsExhausted | Self::InflightClosed => {
                ReasonCode::IMPLEMENTATION_SPECIFIC_ERROR
            }
        }
    }
}
