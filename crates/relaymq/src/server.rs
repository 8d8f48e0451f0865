//! `Broker` builder, accept loop and connection handshake.
//!
//! This is the entry point for running relaymq. It ties together all the
//! layers: transport → protocol → session → router, with the per-connection
//! engine on top.

use std::sync::Arc;

use bytes::BytesMut;
use relaymq_protocol::{
    ConnAck, Connect, Decoder, Packet, PacketType, Properties, ProtocolError, ProtocolVersion,
    ReasonCode, encode,
};
use relaymq_router::{BrokerConfig, BrokerObserver, Direction, ProtocolHub};
use relaymq_session::{AllowAll, Authenticator, ClientIdGenerator};
use relaymq_transport::{Connection, TcpTransport, Transport, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::{BrokerError, engine};

/// Free space kept in the receive buffer while waiting for CONNECT.
const CONNECT_READ_RESERVE: usize = 1024;

// ---------------------------------------------------------------------------
// BrokerBuilder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a broker.
///
/// # Example
///
/// ```rust,ignore
/// use relaymq::prelude::*;
///
/// let server = Broker::builder()
///     .bind("0.0.0.0:1883")
///     .config(BrokerConfig::default())
///     .build(AllowAll)
///     .await?;
/// server.run().await
/// ```
pub struct BrokerBuilder {
    bind_addr: String,
    config: BrokerConfig,
    observer: Option<Arc<dyn BrokerObserver>>,
    client_ids: Option<ClientIdGenerator>,
}

impl BrokerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:1883".to_string(),
            config: BrokerConfig::default(),
            observer: None,
            client_ids: None,
        }
    }

    /// Sets the address [`build`](Self::build) listens on.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs an observer for messages, subscriptions and packets.
    pub fn observer(mut self, observer: Arc<dyn BrokerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the generator for ids assigned to clients that connect
    /// with an empty client id.
    pub fn client_ids(mut self, client_ids: ClientIdGenerator) -> Self {
        self.client_ids = Some(client_ids);
        self
    }

    /// Builds a broker without a listener, for connections accepted
    /// elsewhere and handed over with [`Broker::serve_connection`].
    ///
    /// Starts the session expiry sweeper, so it must be called from within
    /// a Tokio runtime.
    pub fn build_embedded<A: Authenticator>(self, auth: A) -> Broker<A> {
        let sweep_interval = self.config.expiry_sweep_interval;
        let mut hub = ProtocolHub::new(self.config, auth);
        if let Some(observer) = self.observer {
            hub = hub.with_observer(observer);
        }
        if let Some(client_ids) = self.client_ids {
            hub = hub.with_client_ids(client_ids);
        }
        let hub = Arc::new(hub);
        hub.spawn_sweeper(sweep_interval);
        Broker { hub }
    }

    /// Binds a TCP listener and builds the broker behind it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Transport`] if the address can't be bound.
    pub async fn build<A: Authenticator>(self, auth: A) -> Result<BrokerServer<A>, BrokerError> {
        let transport = TcpTransport::bind(&self.bind_addr).await?;
        let broker = self.build_embedded(auth);
        Ok(BrokerServer { transport, broker })
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// A broker that serves connections from any transport.
///
/// Cloning is cheap; every clone shares the same sessions.
pub struct Broker<A: Authenticator = AllowAll> {
    hub: Arc<ProtocolHub<A>>,
}

impl<A: Authenticator> Clone for Broker<A> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
        }
    }
}

impl Broker {
    /// Creates a new builder.
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::new()
    }
}

impl<A: Authenticator> Broker<A> {
    /// The routing core shared by all connections.
    pub fn hub(&self) -> &Arc<ProtocolHub<A>> {
        &self.hub
    }

    /// Accepts connections from `transport` and serves each on its own
    /// task. Runs until the process is terminated.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<(), BrokerError> {
        tracing::info!("relaymq broker running");

        loop {
            match transport.accept().await {
                Ok(conn) => {
                    self.spawn_connection(conn);
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Serves `conn` on a new task.
    pub fn spawn_connection<C: Connection>(&self, conn: C) -> JoinHandle<Result<(), BrokerError>> {
        let broker = self.clone();
        tokio::spawn(async move {
            let result = broker.serve_connection(conn).await;
            if let Err(e) = &result {
                tracing::debug!(error = %e, "connection ended with error");
            }
            result
        })
    }

    /// Serves one connection from CONNECT to close.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Timeout`] if no CONNECT was accepted within the
    ///   connect timeout.
    /// - [`BrokerError::Rejected`] if the CONNECT was refused (the client
    ///   got a CONNACK saying why).
    /// - Anything that ended the session abnormally afterwards.
    pub async fn serve_connection<C: Connection>(&self, conn: C) -> Result<(), BrokerError> {
        let conn_id = conn.id();
        let peer = conn.peer_addr();
        tracing::debug!(%conn_id, ?peer, "handling new connection");

        let (mut reader, mut writer) = conn.into_split();
        let config = self.hub.config();
        let deadline = tokio::time::Instant::now() + config.connect_timeout;

        // --- Step 1: read CONNECT ---
        let read = read_connect(&mut reader, max_connect_size(config));
        let (connect, size, mut decoder) = match tokio::time::timeout_at(deadline, read).await {
            Ok(Ok(found)) => found,
            Ok(Err(BrokerError::Protocol(ProtocolError::UnsupportedProtocolVersion(level)))) => {
                tracing::debug!(%conn_id, level, "unsupported protocol level");
                let connack = refusal(ReasonCode::UNSUPPORTED_PROTOCOL_VERSION);
                self.refuse(&mut writer, ProtocolVersion::V3_1_1, connack).await;
                return Err(ProtocolError::UnsupportedProtocolVersion(level).into());
            }
            Ok(Err(e)) => {
                self.close(&mut writer).await;
                return Err(e);
            }
            Err(_) => {
                tracing::debug!(%conn_id, "no CONNECT before the connect timeout");
                self.close(&mut writer).await;
                return Err(BrokerError::Timeout);
            }
        };

        // --- Step 2: admission ---
        let version = connect.protocol_version;
        let accepted = match tokio::time::timeout_at(deadline, self.hub.connect(*connect)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(rejection)) => {
                self.refuse(&mut writer, version, rejection.connack()).await;
                return Err(rejection.into());
            }
            Err(_) => {
                tracing::debug!(%conn_id, "connect timed out waiting for the session");
                self.close(&mut writer).await;
                return Err(BrokerError::Timeout);
            }
        };

        self.hub.observer().on_packet(
            accepted.session.client_id(),
            Direction::Inbound,
            PacketType::Connect,
            size,
        );
        tracing::debug!(
            client_id = %accepted.session.client_id(),
            %conn_id,
            "starting session engine"
        );

        // --- Step 3: session engine ---
        decoder.set_version(version);
        decoder.set_max_packet_size(accepted.protocol.max_packet_size as usize);
        engine::run(Arc::clone(&self.hub), accepted, decoder, reader, writer, conn_id).await
    }

    /// Sends a refusing CONNACK and closes, bounded by the disconnect
    /// timeout.
    async fn refuse<W>(&self, writer: &mut W, version: ProtocolVersion, connack: ConnAck)
    where
        W: AsyncWrite + Unpin,
    {
        let mut bytes = BytesMut::new();
        if let Err(e) = encode(&Packet::ConnAck(connack), version, usize::MAX, &mut bytes) {
            tracing::debug!(error = %e, "failed to encode CONNACK");
        }
        let limit = self.hub.config().disconnect_timeout;
        let _ = tokio::time::timeout(limit, write_and_close(writer, &bytes)).await;
    }

    async fn close<W>(&self, writer: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        let limit = self.hub.config().disconnect_timeout;
        let _ = tokio::time::timeout(limit, writer.shutdown()).await;
    }
}

// ---------------------------------------------------------------------------
// BrokerServer
// ---------------------------------------------------------------------------

/// A broker bound to a TCP listener.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct BrokerServer<A: Authenticator = AllowAll> {
    transport: TcpTransport,
    broker: Broker<A>,
}

impl<A: Authenticator> BrokerServer<A> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The broker behind the listener, e.g. to serve other transports too.
    pub fn broker(&self) -> &Broker<A> {
        &self.broker
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), BrokerError> {
        self.broker.serve(self.transport).await
    }
}

// ---------------------------------------------------------------------------
// Handshake helpers
// ---------------------------------------------------------------------------

/// Reads until the first packet, which must be CONNECT. Returns it with
/// its size and the decoder holding whatever followed it.
async fn read_connect<R>(
    reader: &mut R,
    max_packet_size: usize,
) -> Result<(Box<Connect>, usize, Decoder), BrokerError>
where
    R: AsyncRead + Unpin,
{
    // The level in CONNECT decides the real version; 3.1.1 framing is
    // only used until then.
    let mut decoder = Decoder::new(ProtocolVersion::V3_1_1, max_packet_size);
    loop {
        if let Some((packet, size)) = decoder.next_packet()? {
            return match packet {
                Packet::Connect(connect) => Ok((connect, size, decoder)),
                other => Err(ProtocolError::violation(format!(
                    "expected CONNECT, got {}",
                    other.packet_type()
                ))
                .into()),
            };
        }

        let buffer = decoder.buffer_mut();
        if buffer.capacity() - buffer.len() < CONNECT_READ_RESERVE / 4 {
            buffer.reserve(CONNECT_READ_RESERVE);
        }
        let n = reader
            .read_buf(buffer)
            .await
            .map_err(TransportError::Read)?;
        if n == 0 {
            return Err(TransportError::PeerClosed("before CONNECT").into());
        }
    }
}

/// The largest CONNECT any configured version accepts.
fn max_connect_size(config: &BrokerConfig) -> usize {
    [&config.v3_1, &config.v3_1_1, &config.v5]
        .iter()
        .map(|protocol| protocol.max_packet_size as usize)
        .max()
        .unwrap_or(usize::MAX)
}

fn refusal(reason_code: ReasonCode) -> ConnAck {
    ConnAck {
        session_present: false,
        reason_code,
        properties: Properties::default(),
    }
}

async fn write_and_close<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    writer.shutdown().await
}
