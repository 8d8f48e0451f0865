//! Per-client session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relaymq_protocol::ProtocolVersion;
use tokio::sync::mpsc;

use crate::alias::{InboundAliases, OutboundAliases};
use crate::{InflightTracker, Message, ReceiveWindow, SubscriptionTable, WillSlot};

/// Limits negotiated for one connection, applied to the session when a
/// client connects or resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Broker-to-client QoS 1/2 window.
    pub max_in_flight: usize,
    /// Client-to-broker QoS 2 window (the broker's Receive Maximum).
    pub max_receive: usize,
    /// Aliases the client may use toward the broker.
    pub inbound_alias_max: u16,
    /// Aliases the broker may use toward the client.
    pub outbound_alias_max: u16,
    pub alias_size_threshold: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 65_535,
            max_receive: 65_535,
            inbound_alias_max: 0,
            outbound_alias_max: 0,
            alias_size_threshold: 0,
        }
    }
}

/// Everything the broker remembers about one client id.
///
/// Shared as `Arc<SessionState>` between the repository, the dispatch
/// path of every publisher, and (while connected) the one engine that
/// owns it. Each part carries its own short-held lock, so publishers
/// enqueueing messages never contend with the engine's ack handling.
#[derive(Debug)]
pub struct SessionState {
    client_id: Arc<str>,
    created_at: Instant,
    version: Mutex<ProtocolVersion>,
    active: AtomicBool,
    subscriptions: SubscriptionTable,
    inflight: InflightTracker,
    receive_window: ReceiveWindow,
    inbound_aliases: Mutex<InboundAliases>,
    outbound_aliases: Mutex<OutboundAliases>,
    will: WillSlot,
    outgoing_tx: mpsc::UnboundedSender<Message>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Seconds; `u32::MAX` never expires.
    session_expiry: AtomicU32,
    disconnected_at: Mutex<Option<Instant>>,
}

impl SessionState {
    pub fn new(client_id: impl Into<Arc<str>>, version: ProtocolVersion, limits: SessionLimits) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            client_id: client_id.into(),
            created_at: Instant::now(),
            version: Mutex::new(version),
            active: AtomicBool::new(false),
            subscriptions: SubscriptionTable::new(),
            inflight: InflightTracker::new(limits.max_in_flight),
            receive_window: ReceiveWindow::new(limits.max_receive),
            inbound_aliases: Mutex::new(InboundAliases::new(limits.inbound_alias_max)),
            outbound_aliases: Mutex::new(OutboundAliases::new(
                limits.outbound_alias_max,
                limits.alias_size_threshold,
            )),
            will: WillSlot::new(),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            session_expiry: AtomicU32::new(0),
            disconnected_at: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn version(&self) -> ProtocolVersion {
        *self.version.lock()
    }

    /// Re-applies connection parameters when a client resumes this
    /// session. Topic alias tables always start empty.
    pub fn reconfigure(&self, version: ProtocolVersion, limits: SessionLimits) {
        *self.version.lock() = version;
        self.inflight.resize(limits.max_in_flight);
        self.receive_window.set_capacity(limits.max_receive);
        *self.inbound_aliases.lock() = InboundAliases::new(limits.inbound_alias_max);
        *self.outbound_aliases.lock() =
            OutboundAliases::new(limits.outbound_alias_max, limits.alias_size_threshold);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Marks the session connected and clears the disconnect time.
    pub fn activate(&self) {
        *self.disconnected_at.lock() = None;
        self.active.store(true, Ordering::Release);
    }

    /// Marks the session disconnected at `now`.
    pub fn deactivate(&self, now: Instant) {
        self.active.store(false, Ordering::Release);
        *self.disconnected_at.lock() = Some(now);
    }

    pub fn disconnected_at(&self) -> Option<Instant> {
        *self.disconnected_at.lock()
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn inflight(&self) -> &InflightTracker {
        &self.inflight
    }

    pub fn receive_window(&self) -> &ReceiveWindow {
        &self.receive_window
    }

    pub fn inbound_aliases(&self) -> &Mutex<InboundAliases> {
        &self.inbound_aliases
    }

    pub fn outbound_aliases(&self) -> &Mutex<OutboundAliases> {
        &self.outbound_aliases
    }

    pub fn will(&self) -> &WillSlot {
        &self.will
    }

    /// Queues a message for delivery. Never blocks; returns `false` only
    /// if the receiving half was dropped for good.
    pub fn enqueue(&self, message: Message) -> bool {
        self.outgoing_tx.send(message).is_ok()
    }

    /// Hands the outgoing queue to the engine that now owns the session.
    pub fn take_outgoing(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.outgoing_rx.lock().take()
    }

    /// Puts the outgoing queue back when the engine stops, so messages
    /// arriving while disconnected wait for the next connection.
    pub fn restore_outgoing(&self, receiver: mpsc::UnboundedReceiver<Message>) {
        *self.outgoing_rx.lock() = Some(receiver);
    }

    pub fn session_expiry(&self) -> u32 {
        self.session_expiry.load(Ordering::Acquire)
    }

    pub fn set_session_expiry(&self, secs: u32) {
        self.session_expiry.store(secs, Ordering::Release);
    }

    /// `true` once a disconnected session has outlived its expiry
    /// interval.
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.is_active() {
            return false;
        }
        let expiry = self.session_expiry();
        if expiry == u32::MAX {
            return false;
        }
        self.disconnected_at()
            .is_some_and(|at| now.saturating_duration_since(at) >= Duration::from_secs(u64::from(expiry)))
    }
}

#[cfg(test)]
mod tests {
    use relaymq_protocol::QoS;

    use super::*;

    fn state() -> SessionState {
        SessionState::new("client-1", ProtocolVersion::V5, SessionLimits::default())
    }

    #[tokio::test]
    async fn test_outgoing_queue_survives_engine_handover() {
        let session = state();
        let mut rx = session.take_outgoing().expect("queue available");
        assert!(session.take_outgoing().is_none());

        assert!(session.enqueue(Message::new("a", "1", QoS::AtMostOnce, false)));
        session.restore_outgoing(rx);
        assert!(session.enqueue(Message::new("a", "2", QoS::AtMostOnce, false)));

        rx = session.take_outgoing().expect("restored");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"1");
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"2");
    }

    #[test]
    fn test_is_expired_after_interval() {
        let session = state();
        let now = Instant::now();
        session.set_session_expiry(10);
        session.activate();
        assert!(!session.is_expired(now + Duration::from_secs(100)));

        session.deactivate(now);
        assert!(!session.is_expired(now + Duration::from_secs(9)));
        assert!(session.is_expired(now + Duration::from_secs(10)));

        session.set_session_expiry(u32::MAX);
        assert!(!session.is_expired(now + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_reconfigure_resets_aliases() {
        let session = state();
        session.reconfigure(
            ProtocolVersion::V5,
            SessionLimits {
                inbound_alias_max: 3,
                ..SessionLimits::default()
            },
        );
        session
            .inbound_aliases()
            .lock()
            .resolve(Some(1), bytes::Bytes::from_static(b"t"))
            .unwrap();
        session.reconfigure(
            ProtocolVersion::V5,
            SessionLimits {
                inbound_alias_max: 3,
                ..SessionLimits::default()
            },
        );
        assert!(
            session
                .inbound_aliases()
                .lock()
                .resolve(Some(1), bytes::Bytes::new())
                .is_err()
        );
    }
}
