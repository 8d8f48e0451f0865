//! Receive loop: reads packets and applies them.

use std::time::{Duration, Instant};

use relaymq_protocol::topic::is_valid_topic_name;
use relaymq_protocol::{
    Ack, Decoder, Disconnect, Packet, Properties, ProtocolError, Publish, QoS, ReasonCode,
};
use relaymq_router::{Direction, ProtocolHub};
use relaymq_session::{Authenticator, Message, PubRecAction, Receipt, SessionState};
use relaymq_transport::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{AckKind, Exit, Outbox};
use crate::BrokerError;

/// Free space kept in the receive buffer before each read.
const READ_RESERVE: usize = 4096;

pub(super) struct Receiver<'a, A: Authenticator, R> {
    hub: &'a ProtocolHub<A>,
    session: &'a SessionState,
    reader: R,
    decoder: Decoder,
    /// One and a half keep-alive intervals; `None` disables the check.
    idle_timeout: Option<Duration>,
    outbox: Outbox,
    v5: bool,
}

impl<'a, A, R> Receiver<'a, A, R>
where
    A: Authenticator,
    R: AsyncRead + Unpin,
{
    pub(super) fn new(
        hub: &'a ProtocolHub<A>,
        session: &'a SessionState,
        reader: R,
        decoder: Decoder,
        idle_timeout: Option<Duration>,
        outbox: Outbox,
    ) -> Self {
        let v5 = decoder.version().is_v5();
        Self {
            hub,
            session,
            reader,
            decoder,
            idle_timeout,
            outbox,
            v5,
        }
    }

    /// Runs until the client disconnects or breaks the protocol.
    pub(super) async fn run(&mut self) -> Result<Exit, BrokerError> {
        loop {
            while let Some((packet, size)) = self.decoder.next_packet()? {
                self.hub.observer().on_packet(
                    self.session.client_id(),
                    Direction::Inbound,
                    packet.packet_type(),
                    size,
                );
                if let Some(exit) = self.handle(packet)? {
                    return Ok(exit);
                }
            }

            let buffer = self.decoder.buffer_mut();
            if buffer.capacity() - buffer.len() < READ_RESERVE / 4 {
                buffer.reserve(READ_RESERVE);
            }
            let read = self.reader.read_buf(buffer);
            let n = match self.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| BrokerError::KeepAliveTimeout)?,
                None => read.await,
            }
            .map_err(TransportError::Read)?;

            if n == 0 {
                return Ok(Exit::Closed);
            }
        }
    }

    fn handle(&mut self, packet: Packet) -> Result<Option<Exit>, BrokerError> {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish)?,
            Packet::PubAck(ack) => {
                self.session.inflight().on_puback(ack.packet_id);
            }
            Packet::PubRec(ack) => self.on_pubrec(&ack)?,
            Packet::PubRel(ack) => {
                let known = self.session.receive_window().release(ack.packet_id);
                if known || !self.v5 {
                    self.outbox.ack(AckKind::PubComp, ack.packet_id)?;
                } else {
                    self.outbox
                        .packet(Packet::PubComp(not_found(ack.packet_id)))?;
                }
            }
            Packet::PubComp(ack) => {
                self.session.inflight().on_pubcomp(ack.packet_id);
            }
            Packet::Subscribe(subscribe) => {
                let suback = self.hub.subscribe(self.session, &subscribe);
                self.outbox.packet(Packet::SubAck(suback))?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                let unsuback = self.hub.unsubscribe(self.session, &unsubscribe);
                self.outbox.packet(Packet::UnsubAck(unsuback))?;
            }
            Packet::PingReq => self.outbox.packet(Packet::PingResp)?,
            Packet::Disconnect(disconnect) => return self.on_disconnect(&disconnect).map(Some),
            Packet::Connect(_) => {
                return Err(ProtocolError::violation("second CONNECT on one connection").into());
            }
            Packet::Auth(_) => {
                return Err(ProtocolError::violation("AUTH without an authentication method").into());
            }
            other => {
                return Err(ProtocolError::violation(format!(
                    "{} is never sent by a client",
                    other.packet_type()
                ))
                .into());
            }
        }
        Ok(None)
    }

    fn on_publish(&mut self, mut publish: Publish) -> Result<(), BrokerError> {
        if self.v5 {
            let topic = std::mem::take(&mut publish.topic);
            publish.topic = self
                .session
                .inbound_aliases()
                .lock()
                .resolve(publish.properties.topic_alias, topic)?;
        }
        if !is_valid_topic_name(&publish.topic) {
            return Err(ProtocolError::malformed("invalid topic name in PUBLISH").into());
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.dispatch(&publish);
            }
            QoS::AtLeastOnce => {
                let delivered = self.dispatch(&publish);
                if self.v5 && delivered == 0 {
                    self.outbox.packet(Packet::PubAck(Ack {
                        packet_id: publish.packet_id,
                        reason_code: ReasonCode::NO_MATCHING_SUBSCRIBERS,
                        properties: Properties::default(),
                    }))?;
                } else {
                    self.outbox.ack(AckKind::PubAck, publish.packet_id)?;
                }
            }
            QoS::ExactlyOnce => {
                // A resend of an id still awaiting PUBREL is acknowledged
                // again but not routed again.
                if self.session.receive_window().record(publish.packet_id)? == Receipt::New {
                    self.dispatch(&publish);
                }
                self.outbox.ack(AckKind::PubRec, publish.packet_id)?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, publish: &Publish) -> usize {
        let message = Message::from_publish(publish, Instant::now());
        self.hub
            .dispatch(&message, Some(self.session.client_id().as_ref()))
    }

    fn on_pubrec(&self, ack: &Ack) -> Result<(), BrokerError> {
        let action = self
            .session
            .inflight()
            .on_pubrec(ack.packet_id, ack.reason_code.is_error());
        match action {
            PubRecAction::SendPubRel => self.outbox.ack(AckKind::PubRel, ack.packet_id),
            PubRecAction::Released => Ok(()),
            PubRecAction::Unknown if self.v5 => {
                self.outbox.packet(Packet::PubRel(not_found(ack.packet_id)))
            }
            PubRecAction::Unknown => self.outbox.ack(AckKind::PubRel, ack.packet_id),
        }
    }

    fn on_disconnect(&self, disconnect: &Disconnect) -> Result<Exit, BrokerError> {
        if let Some(requested) = disconnect.properties.session_expiry_interval {
            if self.session.session_expiry() == 0 && requested != 0 {
                return Err(ProtocolError::violation(
                    "session expiry set on DISCONNECT after connecting with zero",
                )
                .into());
            }
            let expiry = requested.min(self.hub.config().max_session_expiry);
            self.session.set_session_expiry(expiry);
        }
        Ok(Exit::Disconnected(disconnect.reason_code))
    }
}

fn not_found(packet_id: u16) -> Ack {
    Ack {
        packet_id,
        reason_code: ReasonCode::PACKET_IDENTIFIER_NOT_FOUND,
        properties: Properties::default(),
    }
}
