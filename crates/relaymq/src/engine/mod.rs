//! The per-connection session engine.
//!
//! Once a CONNECT is accepted, a connection is driven by three loops that
//! run concurrently on the connection's task:
//!
//! ```text
//!              ┌──────────────┐   acks, SUBACK, PINGRESP   ┌──────────┐
//!  socket ───► │   receive    │ ─────────────────────────► │          │
//!   (read)     └──────────────┘                            │  writer  │ ───► socket
//!              ┌──────────────┐   PUBLISH (with packet id) │          │      (write)
//!  outgoing ─► │  publisher   │ ─────────────────────────► │          │
//!   queue      └──────────────┘                            └──────────┘
//! ```
//!
//! The receive loop applies inbound packets to the session and the hub.
//! The publisher drains the session's outgoing queue under the in-flight
//! limit. The writer owns the write half and is the only place bytes are
//! encoded, so outbound topic aliases are decided there.
//!
//! When any loop stops (or the session is claimed by a newer connection)
//! the others are cancelled, a 5.0 client is told why, the writer gets a
//! bounded chance to drain, and the session is handed back to the hub.

mod publish;
mod receive;
mod writer;

use std::sync::Arc;

use relaymq_protocol::{Decoder, Disconnect, Packet, PacketType, Properties, ReasonCode};
use relaymq_router::{Accepted, DisconnectKind, ProtocolHub};
use relaymq_session::Authenticator;
use relaymq_transport::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::BrokerError;
use publish::Publisher;
use receive::Receiver;
use writer::Writer;

// ---------------------------------------------------------------------------
// Outbound descriptors
// ---------------------------------------------------------------------------

/// A packet waiting for the writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Packet(Packet),
    /// A success acknowledgement without properties. Its four bytes are
    /// the same in every protocol version.
    Ack(AckKind, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckKind {
    PubAck,
    PubRec,
    PubRel,
    PubComp,
}

impl AckKind {
    /// Fixed header byte, including the reserved flags PUBREL requires.
    fn first_byte(self) -> u8 {
        match self {
            Self::PubAck => 0x40,
            Self::PubRec => 0x50,
            Self::PubRel => 0x62,
            Self::PubComp => 0x70,
        }
    }

    fn packet_type(self) -> PacketType {
        match self {
            Self::PubAck => PacketType::PubAck,
            Self::PubRec => PacketType::PubRec,
            Self::PubRel => PacketType::PubRel,
            Self::PubComp => PacketType::PubComp,
        }
    }
}

/// Sending side of the writer's queue.
#[derive(Debug, Clone)]
pub(crate) struct Outbox(mpsc::UnboundedSender<Outbound>);

impl Outbox {
    pub(crate) fn packet(&self, packet: Packet) -> Result<(), BrokerError> {
        self.send(Outbound::Packet(packet))
    }

    pub(crate) fn ack(&self, kind: AckKind, packet_id: u16) -> Result<(), BrokerError> {
        self.send(Outbound::Ack(kind, packet_id))
    }

    fn send(&self, outbound: Outbound) -> Result<(), BrokerError> {
        self.0
            .send(outbound)
            .map_err(|_| BrokerError::Internal("packet writer has stopped".into()))
    }
}

/// How the loops ended when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The client sent DISCONNECT with this reason code.
    Disconnected(ReasonCode),
    /// The client closed the stream.
    Closed,
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Drives an accepted connection until it ends, then releases its session.
///
/// `decoder` is the one that read the CONNECT; any bytes the client sent
/// after it are still buffered there.
///
/// # Errors
///
/// Returns why the connection ended abnormally. Either way the session
/// has been released to the hub by the time this returns.
pub(crate) async fn run<A, R, W>(
    hub: Arc<ProtocolHub<A>>,
    accepted: Accepted,
    decoder: Decoder,
    reader: R,
    writer: W,
    conn_id: ConnectionId,
) -> Result<(), BrokerError>
where
    A: Authenticator,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let Accepted {
        session,
        lease,
        connack,
        version,
        keep_alive,
        client_max_packet_size,
        protocol,
    } = accepted;
    let client_id = Arc::clone(session.client_id());

    let Some(mut queue) = session.take_outgoing() else {
        hub.release(&session, DisconnectKind::Abnormal);
        return Err(BrokerError::Internal("outgoing queue already taken".into()));
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outbox = Outbox(tx);
    // CONNACK is queued before anything the publisher resends. The
    // receiving end is held right here, so this cannot fail.
    let _ = outbox.packet(Packet::ConnAck(connack));

    let idle_timeout = (!keep_alive.is_zero()).then(|| keep_alive + keep_alive / 2);
    let mut receiver = Receiver::new(&hub, &session, reader, decoder, idle_timeout, outbox.clone());
    let mut publisher = Publisher::new(&session, version, outbox.clone());
    let mut writer = Writer::new(
        &session,
        hub.observer().as_ref(),
        writer,
        version,
        client_max_packet_size,
        protocol.max_unflushed_bytes,
    );
    let disconnect_timeout = hub.config().disconnect_timeout;

    let (outcome, waiting) = {
        let writing = writer.run(&mut rx);
        tokio::pin!(writing);
        let mut writer_done = false;

        let outcome = tokio::select! {
            result = receiver.run() => result,
            result = publisher.run(&mut queue) => result,
            result = &mut writing => {
                writer_done = true;
                result.and(Err(BrokerError::Internal("packet writer stopped".into())))
            }
            () = lease.contended() => Err(BrokerError::TakenOver),
        };

        let waiting = publisher.take_waiting();
        drop(receiver);
        drop(publisher);

        if version.is_v5() {
            if let Some(reason_code) = outcome.as_ref().err().and_then(BrokerError::disconnect_reason) {
                let _ = outbox.packet(Packet::Disconnect(Disconnect {
                    reason_code,
                    properties: Properties::default(),
                }));
            }
        }
        drop(outbox);

        // With every sender gone the writer stops once its queue is empty.
        if !writer_done {
            match tokio::time::timeout(disconnect_timeout, &mut writing).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(%conn_id, error = %e, "final flush failed"),
                Err(_) => tracing::debug!(%conn_id, "final flush timed out"),
            }
        }
        (outcome, waiting)
    };
    let _ = tokio::time::timeout(disconnect_timeout, writer.shutdown()).await;

    if let Some(message) = waiting {
        session.enqueue(message);
    }
    session.restore_outgoing(queue);

    let kind = match &outcome {
        Ok(Exit::Disconnected(ReasonCode::NORMAL_DISCONNECTION)) => DisconnectKind::Normal,
        Ok(Exit::Disconnected(_)) => DisconnectKind::WithWill,
        Ok(Exit::Closed) | Err(_) => DisconnectKind::Abnormal,
    };
    hub.release(&session, kind);
    drop(lease);

    match outcome {
        Ok(exit) => {
            tracing::info!(%client_id, %conn_id, ?exit, "client disconnected");
            Ok(())
        }
        Err(e) => {
            tracing::info!(%client_id, %conn_id, error = %e, "connection closed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_kind_first_byte_sets_pubrel_flags() {
        assert_eq!(AckKind::PubAck.first_byte(), 0x40);
        assert_eq!(AckKind::PubRel.first_byte(), 0x62);
        assert_eq!(AckKind::PubComp.packet_type(), PacketType::PubComp);
    }

    #[test]
    fn test_outbox_send_after_writer_gone_is_internal_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Outbox(tx);
        drop(rx);
        let err = outbox.ack(AckKind::PubAck, 1).unwrap_err();
        assert!(matches!(err, BrokerError::Internal(_)));
    }
}
