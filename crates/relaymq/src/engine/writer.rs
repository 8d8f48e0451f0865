//! Packet writer: encodes descriptors and batches them onto the socket.

use bytes::{BufMut, Bytes, BytesMut};
use relaymq_protocol::{Encoder, Packet, PacketType, ProtocolVersion, Publish};
use relaymq_router::{BrokerObserver, Direction};
use relaymq_session::SessionState;
use relaymq_session::alias::AliasDecision;
use relaymq_transport::TransportError;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

use super::Outbound;
use crate::BrokerError;

pub(super) struct Writer<'a, W> {
    session: &'a SessionState,
    observer: &'a dyn BrokerObserver,
    inner: W,
    encoder: Encoder,
    buffer: BytesMut,
    max_unflushed: usize,
    v5: bool,
}

impl<'a, W: AsyncWrite + Unpin> Writer<'a, W> {
    pub(super) fn new(
        session: &'a SessionState,
        observer: &'a dyn BrokerObserver,
        inner: W,
        version: ProtocolVersion,
        client_max_packet_size: usize,
        max_unflushed: usize,
    ) -> Self {
        Self {
            session,
            observer,
            inner,
            encoder: Encoder::new(version, client_max_packet_size),
            buffer: BytesMut::with_capacity(max_unflushed.min(64 * 1024)),
            max_unflushed: max_unflushed.max(1),
            v5: version.is_v5(),
        }
    }

    /// Writes until every sender is gone and the queue is empty.
    ///
    /// Everything that is already queued goes into one buffer, which is
    /// flushed when the queue runs dry or the buffer reaches the
    /// unflushed-bytes limit, whichever comes first.
    pub(super) async fn run(
        &mut self,
        queue: &mut UnboundedReceiver<Outbound>,
    ) -> Result<(), BrokerError> {
        while let Some(first) = queue.recv().await {
            self.encode(first)?;
            while self.buffer.len() < self.max_unflushed {
                match queue.try_recv() {
                    Ok(next) => self.encode(next)?,
                    Err(_) => break,
                }
            }
            self.flush().await?;
        }
        Ok(())
    }

    pub(super) async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.inner
            .write_all(&self.buffer)
            .await
            .map_err(TransportError::Write)?;
        self.inner.flush().await.map_err(TransportError::Write)?;
        self.buffer.clear();
        Ok(())
    }

    fn encode(&mut self, outbound: Outbound) -> Result<(), BrokerError> {
        let (packet_type, size) = match outbound {
            Outbound::Ack(kind, packet_id) => {
                self.buffer.put_u8(kind.first_byte());
                self.buffer.put_u8(2);
                self.buffer.put_u16(packet_id);
                (kind.packet_type(), 4)
            }
            Outbound::Packet(Packet::Publish(publish)) => {
                (PacketType::Publish, self.encode_publish(publish)?)
            }
            Outbound::Packet(packet) => {
                let size = self.encode_packet(&packet)?;
                if size == 0 {
                    tracing::debug!(
                        client_id = %self.session.client_id(),
                        packet_type = %packet.packet_type(),
                        "packet exceeds the client's maximum packet size, dropped"
                    );
                }
                (packet.packet_type(), size)
            }
        };
        if size > 0 {
            self.observer.on_packet(
                self.session.client_id(),
                Direction::Outbound,
                packet_type,
                size,
            );
        }
        Ok(())
    }

    /// The broker built `packet` itself, so a failure here is on our
    /// side and is not reported to the client as malformed input.
    fn encode_packet(&mut self, packet: &Packet) -> Result<usize, BrokerError> {
        self.encoder.encode(packet, &mut self.buffer).map_err(|e| {
            BrokerError::Internal(format!("cannot encode outgoing {}: {e}", packet.packet_type()))
        })
    }

    /// Applies the outbound topic alias, then encodes. A PUBLISH too large
    /// for the client is dropped: its alias assignment is undone and its
    /// in-flight slot freed.
    fn encode_publish(&mut self, mut publish: Publish) -> Result<usize, BrokerError> {
        let topic = publish.topic.clone();
        let decision = if self.v5 {
            self.session.outbound_aliases().lock().decide(&topic)
        } else {
            AliasDecision::Unaliased
        };
        match decision {
            AliasDecision::Unaliased => {}
            AliasDecision::Fresh(alias) => publish.properties.topic_alias = Some(alias),
            AliasDecision::Known(alias) => {
                publish.properties.topic_alias = Some(alias);
                publish.topic = Bytes::new();
            }
        }

        let packet_id = publish.packet_id;
        let size = self.encode_packet(&Packet::Publish(publish))?;
        if size == 0 {
            if let AliasDecision::Fresh(_) = decision {
                self.session.outbound_aliases().lock().forget(&topic);
            }
            if packet_id != 0 {
                self.session.inflight().abandon(packet_id);
            }
            tracing::debug!(
                client_id = %self.session.client_id(),
                topic = %String::from_utf8_lossy(&topic),
                "PUBLISH exceeds the client's maximum packet size, dropped"
            );
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use relaymq_protocol::{Auth, Properties, ReasonCode};
    use relaymq_router::NoopObserver;
    use relaymq_session::SessionLimits;

    use super::*;

    #[test]
    fn test_encode_failure_is_internal_not_malformed() {
        let session = SessionState::new("c1", ProtocolVersion::V3_1_1, SessionLimits::default());
        let mut writer = Writer::new(
            &session,
            &NoopObserver,
            tokio::io::sink(),
            ProtocolVersion::V3_1_1,
            usize::MAX,
            1024,
        );

        let err = writer
            .encode(Outbound::Packet(Packet::Auth(Auth {
                reason_code: ReasonCode::SUCCESS,
                properties: Properties::default(),
            })))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Internal(_)));
        assert_eq!(err.disconnect_reason(), Some(ReasonCode::UNSPECIFIED_ERROR));
    }
}
