//! Broker observers.
//!
//! An observer sees what flows through the broker without taking part in
//! it: every routed message, every subscription change and every packet
//! on the wire. Callbacks run inline on the connection's tasks, so they
//! must be quick and must not block.

use relaymq_protocol::{PacketType, ReasonCode, Subscribe, Unsubscribe};
use relaymq_session::Message;

/// Which way a packet travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Hooks for metrics, auditing and tests. Every method has a no-op
/// default.
pub trait BrokerObserver: Send + Sync + 'static {
    /// A message is about to be fanned out. Called once per message,
    /// after QoS 2 duplicate suppression. `sender` is `None` for will
    /// messages.
    fn on_message(&self, _sender: Option<&str>, _message: &Message) {}

    /// A copy of a routed message was queued for `client_id`, with QoS
    /// and retain already capped by the matching subscription.
    fn on_deliver(&self, _client_id: &str, _message: &Message) {}

    /// A SUBSCRIBE was processed; `results` holds one reason code per
    /// filter, in request order.
    fn on_subscribe(&self, _client_id: &str, _subscribe: &Subscribe, _results: &[ReasonCode]) {}

    fn on_unsubscribe(&self, _client_id: &str, _unsubscribe: &Unsubscribe) {}

    /// A packet of `size` bytes was read or written.
    fn on_packet(
        &self,
        _client_id: &str,
        _direction: Direction,
        _packet_type: PacketType,
        _size: usize,
    ) {
    }
}

/// Observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BrokerObserver for NoopObserver {}
