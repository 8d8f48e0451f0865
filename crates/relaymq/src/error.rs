//! Unified error type for the relaymq broker.

use relaymq_protocol::{ProtocolError, ReasonCode};
use relaymq_router::ConnectRejection;
use relaymq_session::SessionError;
use relaymq_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Every connection served by the broker ends with `Ok(())` (the client
/// disconnected or closed the stream) or one of these.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Reading, writing or accepting failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The client sent bytes that aren't valid MQTT here.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The client broke a session rule (receive maximum, topic alias).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The CONNECT was refused; the client got a CONNACK saying why.
    #[error(transparent)]
    Rejected(#[from] ConnectRejection),

    /// No CONNECT arrived within the connect timeout.
    #[error("no CONNECT within the connect timeout")]
    Timeout,

    /// Nothing arrived within one and a half keep-alive intervals.
    #[error("keep-alive timeout")]
    KeepAliveTimeout,

    /// A newer connection claimed the same client id.
    #[error("session taken over by another connection")]
    TakenOver,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The reason code a 5.0 client is sent in the closing DISCONNECT, or
    /// `None` when the connection closes without one.
    pub fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            Self::Protocol(e) => Some(e.reason_code()),
            Self::Session(e) => Some(e.reason_code()),
            Self::KeepAliveTimeout => Some(ReasonCode::KEEP_ALIVE_TIMEOUT),
            Self::TakenOver => Some(ReasonCode::SESSION_TAKEN_OVER),
            Self::Internal(_) => Some(ReasonCode::UNSPECIFIED_ERROR),
            Self::Transport(_) | Self::Rejected(_) | Self::Timeout => None,
        }
    }
}
