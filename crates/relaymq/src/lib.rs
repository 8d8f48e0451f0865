//! # relaymq
//!
//! Embeddable MQTT broker core speaking protocol versions 3.1, 3.1.1 and
//! 5.0 over any ordered byte stream.
//!
//! The broker authenticates clients, keeps sessions across reconnects
//! (subscriptions, unacknowledged messages, wills), routes PUBLISH packets
//! to matching subscribers at the right QoS, and enforces in-flight
//! limits, keep-alive and topic aliases per connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaymq::prelude::*;
//!
//! # async fn start() -> Result<(), BrokerError> {
//! let server = Broker::builder()
//!     .bind("0.0.0.0:1883")
//!     .build(AllowAll)
//!     .await?;
//! server.run().await
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Engine (this crate)  ← one per connection: receive, publish, write loops
//!     ↕
//! Router               ← admission, takeover, fan-out, wills, expiry
//!     ↕
//! Session              ← subscriptions, in-flight tracking, aliases
//!     ↕
//! Protocol             ← packets, codec, topic matching
//!     ↕
//! Transport            ← TCP listener or any AsyncRead + AsyncWrite
//! ```

mod engine;
mod error;
mod server;

pub use error::BrokerError;
pub use server::{Broker, BrokerBuilder, BrokerServer};

pub use relaymq_protocol as protocol;
pub use relaymq_router as router;
pub use relaymq_session as session;
pub use relaymq_transport as transport;

/// Common imports for relaymq users.
///
/// ```rust
/// use relaymq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Broker, BrokerBuilder, BrokerError, BrokerServer};

    pub use relaymq_protocol::{ProtocolVersion, QoS, ReasonCode};
    pub use relaymq_router::{
        BrokerConfig, BrokerObserver, Direction, NoopObserver, ProtocolConfig,
    };
    pub use relaymq_session::{AllowAll, Authenticator, ClientIdGenerator, Message};
    pub use relaymq_transport::{
        Connection, ConnectionId, ConnectionIds, StreamConnection, TcpTransport, Transport,
    };
}
