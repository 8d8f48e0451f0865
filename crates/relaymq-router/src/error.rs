//! Error types for the router layer.

use relaymq_protocol::{ConnAck, Properties, ReasonCode};

/// Why a CONNECT was refused.
///
/// Carries the reason code for the refusing CONNACK; 3.x connections get
/// the matching return code when it is encoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connect rejected ({reason_code}): {reason}")]
pub struct ConnectRejection {
    pub reason_code: ReasonCode,
    pub reason: String,
}

impl ConnectRejection {
    pub fn new(reason_code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            reason_code,
            reason: reason.into(),
        }
    }

    /// The CONNACK that tells the client.
    pub fn connack(&self) -> ConnAck {
        ConnAck {
            session_present: false,
            reason_code: self.reason_code,
            properties: Properties::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connack_carries_reason_code() {
        let rejection = ConnectRejection::new(ReasonCode::NOT_AUTHORIZED, "no");
        let connack = rejection.connack();
        assert_eq!(connack.reason_code, ReasonCode::NOT_AUTHORIZED);
        assert!(!connack.session_present);
        assert!(rejection.to_string().contains("0x87"));
    }
}
