//! Broker configuration.

use std::time::Duration;

use relaymq_protocol::ProtocolVersion;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ProtocolConfig
// ---------------------------------------------------------------------------

/// Limits applied to connections speaking one protocol version.
///
/// Topic alias settings only take effect for 5.0 connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Upper bound on unacknowledged QoS 1/2 messages sent to a client.
    /// A 5.0 client's Receive Maximum lowers it further.
    pub max_in_flight: u16,

    /// QoS 2 messages a client may have outstanding toward the broker
    /// (announced as Receive Maximum).
    pub max_receive: u16,

    /// Largest inbound packet accepted, in bytes (announced as Maximum
    /// Packet Size).
    pub max_packet_size: u32,

    /// The writer flushes once this many bytes are buffered, even if more
    /// packets are queued.
    pub max_unflushed_bytes: usize,

    /// Aliases a client may use toward the broker (announced as Topic
    /// Alias Maximum).
    pub topic_alias_max: u16,

    /// Cap on the aliases the broker uses toward a client, whatever the
    /// client offers.
    pub client_topic_alias_maximum: u16,

    /// Outbound topics shorter than this are never aliased.
    pub topic_alias_size_threshold: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            max_receive: 1024,
            max_packet_size: 1024 * 1024,
            max_unflushed_bytes: 64 * 1024,
            topic_alias_max: 16,
            client_topic_alias_maximum: 16,
            topic_alias_size_threshold: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

/// Configuration for the whole broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub v3_1: ProtocolConfig,
    pub v3_1_1: ProtocolConfig,
    pub v5: ProtocolConfig,

    /// Time allowed between accepting a connection and sending CONNACK.
    pub connect_timeout: Duration,

    /// Time allowed for the final DISCONNECT to reach the client before
    /// the transport is torn down.
    pub disconnect_timeout: Duration,

    /// Keep-alive imposed on 5.0 clients that connect with keep-alive 0,
    /// announced as Server Keep Alive. `None` leaves them without one.
    pub default_keep_alive: Option<u16>,

    /// Cap on the session expiry interval a client may request, in
    /// seconds. `u32::MAX` means no cap.
    pub max_session_expiry: u32,

    /// How often disconnected sessions are checked for expiry.
    pub expiry_sweep_interval: Duration,
}

impl BrokerConfig {
    /// The limits for connections speaking `version`.
    pub fn for_version(&self, version: ProtocolVersion) -> &ProtocolConfig {
        match version {
            ProtocolVersion::V3_1 => &self.v3_1,
            ProtocolVersion::V3_1_1 => &self.v3_1_1,
            ProtocolVersion::V5 => &self.v5,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            v3_1: ProtocolConfig::default(),
            v3_1_1: ProtocolConfig::default(),
            v5: ProtocolConfig::default(),
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            default_keep_alive: None,
            max_session_expiry: u32::MAX,
            expiry_sweep_interval: Duration::from_secs(30),
        }
    }
}
