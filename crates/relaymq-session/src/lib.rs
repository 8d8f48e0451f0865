//! Session layer for relaymq.
//!
//! Everything the broker remembers about a client between packets and
//! across reconnects:
//!
//! 1. **Session state** ([`SessionState`]): subscriptions, the outgoing
//!    message queue, topic aliases and the will message.
//! 2. **QoS engine** ([`InflightTracker`], [`ReceiveWindow`]): the
//!    send-side PUBACK/PUBREC/PUBCOMP handshakes and receive-side QoS 2
//!    duplicate suppression.
//! 3. **Repository** ([`SessionRepository`]): all sessions by client id,
//!    with the ownership [`Lease`] that allows one live connection per id.
//! 4. **Identity** ([`Authenticator`], [`ClientIdGenerator`]).
//!
//! # How it fits in the stack
//!
//! ```text
//! Router (above)    ← creates, resumes and releases sessions, fans out messages
//!     ↕
//! Session (this crate)  ← per-client state machines
//!     ↕
//! Protocol (below)  ← packets, QoS, properties, topic matching
//! ```

mod auth;
mod client_id;
mod dedup;
mod error;
mod inflight;
mod lease;
mod message;
mod repository;
mod state;
mod subscription;
mod will;

pub mod alias;

pub use auth::{AllowAll, Authenticator};
pub use client_id::ClientIdGenerator;
pub use dedup::{Receipt, ReceiveWindow};
pub use error::SessionError;
pub use inflight::{InflightState, InflightTracker, PubRecAction, Retransmit};
pub use lease::{Lease, LeaseGuard};
pub use message::Message;
pub use repository::SessionRepository;
pub use state::{SessionLimits, SessionState};
pub use subscription::{Subscription, SubscriptionMatch, SubscriptionTable};
pub use will::{WillSlot, WillState};
