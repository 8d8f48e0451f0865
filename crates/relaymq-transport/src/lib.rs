//! Transport abstraction layer for relaymq.
//!
//! The broker core never touches sockets directly. It sees an ordered,
//! duplex byte stream that can be split into a read half (consumed
//! incrementally by the receive loop) and a write half (buffered writes
//! plus an explicit flush, driven by the writer loop).
//!
//! - [`Transport`] accepts new connections.
//! - [`Connection`] is one accepted byte stream.
//! - [`StreamConnection`] adapts any `AsyncRead + AsyncWrite` stream
//!   (TLS streams, in-memory pipes in tests).
//!
//! # Feature Flags
//!
//! - `tcp` (default): plain TCP listener via `tokio::net`

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "tcp")]
mod tcp;

pub use error::TransportError;
#[cfg(feature = "tcp")]
pub use tcp::{TcpConnection, TcpTransport};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Identifies one accepted connection in logs.
///
/// Ids only need to be unique within one broker process; they say nothing
/// about the client behind the connection, which is known by its MQTT
/// client id once CONNECT arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out increasing [`ConnectionId`]s starting at 1.
///
/// Each listener owns one; embedders that accept streams themselves can
/// use their own for [`StreamConnection`]s.
#[derive(Debug)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A source of incoming connections, such as a listening socket.
pub trait Transport: Send + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for the next incoming connection.
    ///
    /// An error concerns this one attempt; the broker logs it and keeps
    /// accepting.
    async fn accept(&mut self) -> Result<Self::Connection, TransportError>;
}

/// A single ordered duplex byte stream.
///
/// The session engine splits the connection once: the read half goes to
/// the receive loop, the write half to the packet writer. Both halves must
/// be usable from different tasks.
pub trait Connection: Send + 'static {
    /// Incremental read side.
    type Reader: AsyncRead + Send + Unpin + 'static;
    /// Buffered write side (the writer calls `flush` explicitly).
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Splits the connection into independently owned halves.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Wraps any `AsyncRead + AsyncWrite` stream as a [`Connection`].
///
/// This is how externally terminated transports (TLS, WebSocket byte
/// streams, `tokio::io::duplex` pipes) are handed to the broker.
pub struct StreamConnection<S> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    stream: S,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps `stream` under the given connection id.
    pub fn new(id: ConnectionId, stream: S) -> Self {
        Self {
            id,
            peer: None,
            stream,
        }
    }

    /// Records the remote address for logging.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = ReadHalf<S>;
    type Writer = WriteHalf<S>;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.stream)
    }
}
