//! Routing layer for relaymq.
//!
//! The router is the part of the broker that sees all sessions at once.
//! Connections enter through the [`ProtocolHub`], which decides whether a
//! CONNECT is admitted, which session it gets and what the CONNACK says.
//! Published messages leave through [`ProtocolHub::dispatch`], which
//! copies them into the outgoing queue of every matching session.
//!
//! # How it fits in the stack
//!
//! ```text
//! Engine (above)    ← one per connection, calls connect/subscribe/dispatch/release
//!     ↕
//! Router (this crate)  ← admission, fan-out, will timers, expiry sweeper
//!     ↕
//! Session (below)   ← per-client state in the session repository
//! ```
//!
//! The hub never blocks on a slow subscriber: outgoing queues are
//! unbounded and each recipient applies its own in-flight limit when it
//! sends.

mod config;
mod error;
mod events;
mod hub;

pub use config::{BrokerConfig, ProtocolConfig};
pub use error::ConnectRejection;
pub use events::{BrokerObserver, Direction, NoopObserver};
pub use hub::{Accepted, DisconnectKind, ProtocolHub};
