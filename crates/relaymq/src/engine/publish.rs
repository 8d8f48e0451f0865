//! Publisher loop: moves queued messages to the writer.

use std::time::Instant;

use relaymq_protocol::{Packet, ProtocolVersion, QoS};
use relaymq_session::{Message, Retransmit, SessionState};
use tokio::sync::mpsc::UnboundedReceiver;

use super::{AckKind, Exit, Outbox};
use crate::BrokerError;

pub(super) struct Publisher<'a> {
    session: &'a SessionState,
    v5: bool,
    outbox: Outbox,
    /// A QoS 1/2 message taken off the queue that is waiting for an
    /// in-flight slot. Kept here so it survives cancellation of `run`.
    waiting: Option<Message>,
}

impl<'a> Publisher<'a> {
    pub(super) fn new(session: &'a SessionState, version: ProtocolVersion, outbox: Outbox) -> Self {
        Self {
            session,
            v5: version.is_v5(),
            outbox,
            waiting: None,
        }
    }

    /// The message that was waiting for a slot when the loop stopped.
    pub(super) fn take_waiting(&mut self) -> Option<Message> {
        self.waiting.take()
    }

    /// Resends what a previous connection left unacknowledged, then
    /// forwards new messages in queue order. Only returns on error.
    pub(super) async fn run(
        &mut self,
        queue: &mut UnboundedReceiver<Message>,
    ) -> Result<Exit, BrokerError> {
        self.retransmit()?;

        loop {
            let Some(message) = queue.recv().await else {
                return Err(BrokerError::Internal("outgoing queue closed".into()));
            };
            if message.is_expired(Instant::now()) {
                tracing::trace!(client_id = %self.session.client_id(), "expired message dropped");
                continue;
            }
            if message.qos == QoS::AtMostOnce {
                let publish = message.to_publish(0, false, self.v5, Instant::now());
                self.outbox.packet(Packet::Publish(publish))?;
                continue;
            }

            self.waiting = Some(message);
            self.session.inflight().acquire().await?;
            if let Some(message) = self.waiting.take() {
                self.send_tracked(message)?;
            }
        }
    }

    /// Registers `message` under a fresh packet id and hands it to the
    /// writer. The caller holds an in-flight slot.
    fn send_tracked(&self, message: Message) -> Result<(), BrokerError> {
        let inflight = self.session.inflight();
        let now = Instant::now();
        if message.is_expired(now) {
            inflight.release_unused();
            return Ok(());
        }
        let packet_id = match inflight.register(message.clone()) {
            Ok(packet_id) => packet_id,
            Err(e) => {
                inflight.release_unused();
                return Err(e.into());
            }
        };
        let publish = message.to_publish(packet_id, false, self.v5, now);
        self.outbox.packet(Packet::Publish(publish))
    }

    fn retransmit(&self) -> Result<(), BrokerError> {
        let inflight = self.session.inflight();
        let now = Instant::now();
        let pending = inflight.pending_retransmits();
        if !pending.is_empty() {
            tracing::debug!(
                client_id = %self.session.client_id(),
                count = pending.len(),
                "resending unacknowledged messages"
            );
        }
        for item in pending {
            match item {
                Retransmit::Publish { packet_id, message } if message.is_expired(now) => {
                    inflight.abandon(packet_id);
                }
                Retransmit::Publish { packet_id, message } => {
                    let publish = message.to_publish(packet_id, true, self.v5, now);
                    self.outbox.packet(Packet::Publish(publish))?;
                }
                Retransmit::PubRel { packet_id } => self.outbox.ack(AckKind::PubRel, packet_id)?,
            }
        }
        Ok(())
    }
}
