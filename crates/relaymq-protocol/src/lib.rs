//! Wire protocol for relaymq.
//!
//! This crate defines the "language" MQTT clients and the broker speak,
//! across protocol generations 3.1, 3.1.1 and 5.0:
//!
//! - **Types** ([`Packet`], [`QoS`], [`ProtocolVersion`], [`ReasonCode`],
//!   [`Properties`]): the structures that travel on the wire.
//! - **Codec** ([`decode_header`], [`decode_packet`], [`Decoder`],
//!   [`Encoder`]): how those structures are converted to and from bytes.
//! - **Topics** ([`topic`]): filter validation and wildcard matching.
//! - **Errors** ([`ProtocolError`]): what can go wrong while decoding.
//!
//! # Architecture
//!
//! The protocol layer sits between the transport (raw bytes) and the
//! session layer (per-client state). It doesn't know about connections or
//! subscribers; it only parses and produces bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (Packet) → Session (client state)
//! ```

mod codec;
mod error;
mod packet;
mod properties;
mod types;

pub mod topic;
pub mod varint;

pub use codec::{
    Decoder, Encoder, FixedHeader, decode_header, decode_packet, encode,
};
pub use error::ProtocolError;
pub use packet::{
    Ack, Auth, ConnAck, Connect, Disconnect, Packet, Publish, RetainHandling,
    SubAck, Subscribe, SubscribeFilter, SubscriptionOptions, UnsubAck,
    Unsubscribe, Will,
};
pub use properties::Properties;
pub use types::{PacketType, ProtocolVersion, QoS, ReasonCode};
