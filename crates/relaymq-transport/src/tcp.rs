//! Plain TCP transport using `tokio::net`.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::{Connection, ConnectionId, ConnectionIds, Transport, TransportError};

/// A TCP [`Transport`] that listens for incoming MQTT connections.
pub struct TcpTransport {
    listener: TcpListener,
    ids: ConnectionIds,
}

impl TcpTransport {
    /// Opens a listener on `addr`, e.g. `"0.0.0.0:1883"`. Port 0 picks
    /// a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(addr, "listening for MQTT over TCP");
        Ok(Self {
            listener,
            ids: ConnectionIds::new(),
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;

        // MQTT control packets are small; don't let Nagle hold acks back.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.ids.next_id();
        tracing::debug!(%id, %addr, "accepted TCP connection");

        Ok(TcpConnection {
            id,
            peer: addr,
            stream,
        })
    }
}

/// A single accepted TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
}

impl Connection for TcpConnection {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        self.stream.into_split()
    }
}
