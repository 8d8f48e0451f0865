//! The protocol hub: where connections become sessions and messages
//! find their subscribers.
//!
//! The hub owns the [`SessionRepository`] and everything that spans more
//! than one connection:
//!
//! - **Admission**: [`ProtocolHub::connect`] validates and authenticates a
//!   CONNECT, takes the client id's ownership lease (evicting a previous
//!   connection), then creates or resumes the session and builds the
//!   CONNACK.
//! - **Routing**: [`ProtocolHub::dispatch`] fans one message out to every
//!   matching session's outgoing queue.
//! - **Teardown**: [`ProtocolHub::release`] applies the will and expiry
//!   rules when a connection ends, and the sweeper destroys sessions whose
//!   expiry interval has run out.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use relaymq_protocol::topic::{is_shared_subscription, is_valid_filter, is_valid_topic_name};
use relaymq_protocol::{
    ConnAck, Connect, Properties, ProtocolVersion, QoS, ReasonCode, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};
use relaymq_session::{
    AllowAll, Authenticator, ClientIdGenerator, LeaseGuard, Message, SessionLimits,
    SessionRepository, SessionState, Subscription,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{BrokerConfig, BrokerObserver, ConnectRejection, NoopObserver, ProtocolConfig};

/// Longest client id a 3.1 server is required to accept.
const V3_1_MAX_CLIENT_ID_LEN: usize = 23;

// ---------------------------------------------------------------------------
// Accepted / DisconnectKind
// ---------------------------------------------------------------------------

/// A CONNECT the hub accepted: everything the engine needs to run the
/// connection.
#[derive(Debug)]
pub struct Accepted {
    pub session: Arc<SessionState>,
    /// Held for the life of the connection.
    pub lease: LeaseGuard,
    pub connack: ConnAck,
    pub version: ProtocolVersion,
    /// Effective keep-alive; zero disables the idle timeout.
    pub keep_alive: Duration,
    /// Largest packet the client is willing to receive.
    pub client_max_packet_size: usize,
    pub protocol: ProtocolConfig,
}

/// How a connection ended. Decides what happens to the will.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// DISCONNECT with reason `0x00`: the will is discarded.
    Normal,
    /// 5.0 DISCONNECT with reason `0x04`: the will is published anyway.
    WithWill,
    /// Transport loss, protocol error, keep-alive timeout or takeover.
    Abnormal,
}

// ---------------------------------------------------------------------------
// ProtocolHub
// ---------------------------------------------------------------------------

/// Shared by every connection of one broker, usually as
/// `Arc<ProtocolHub<A>>`.
pub struct ProtocolHub<A: Authenticator = AllowAll> {
    config: BrokerConfig,
    sessions: SessionRepository,
    client_ids: ClientIdGenerator,
    authenticator: A,
    observer: Arc<dyn BrokerObserver>,
}

impl<A: Authenticator> ProtocolHub<A> {
    /// Creates a hub with no sessions and no observer.
    pub fn new(config: BrokerConfig, authenticator: A) -> Self {
        Self {
            config,
            sessions: SessionRepository::new(),
            client_ids: ClientIdGenerator::new(),
            authenticator,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replaces the generator used for clients that connect without an id.
    pub fn with_client_ids(mut self, client_ids: ClientIdGenerator) -> Self {
        self.client_ids = client_ids;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BrokerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn observer(&self) -> &Arc<dyn BrokerObserver> {
        &self.observer
    }

    // -- admission ----------------------------------------------------------

    /// Checks a CONNECT for problems that don't depend on broker state.
    ///
    /// The protocol level and the will QoS were already checked while
    /// decoding; what is left is the client id, the will topic and the
    /// 5.0 features this broker doesn't offer.
    ///
    /// # Errors
    ///
    /// Returns the reason code to refuse the connection with.
    pub fn validate(&self, connect: &Connect) -> Result<(), ConnectRejection> {
        let version = connect.protocol_version;
        let id_len = connect.client_id.len();

        if version == ProtocolVersion::V3_1 && !(1..=V3_1_MAX_CLIENT_ID_LEN).contains(&id_len) {
            return Err(ConnectRejection::new(
                ReasonCode::CLIENT_IDENTIFIER_NOT_VALID,
                format!("client id must be 1 to {V3_1_MAX_CLIENT_ID_LEN} bytes"),
            ));
        }
        if id_len == 0 && !version.is_v5() && !connect.clean_start {
            return Err(ConnectRejection::new(
                ReasonCode::CLIENT_IDENTIFIER_NOT_VALID,
                "an empty client id requires a clean session",
            ));
        }

        if let Some(will) = &connect.will {
            if !is_valid_topic_name(&will.topic) {
                return Err(ConnectRejection::new(
                    ReasonCode::TOPIC_NAME_INVALID,
                    "invalid will topic",
                ));
            }
            if will.properties.payload_format_indicator == Some(1)
                && std::str::from_utf8(&will.payload).is_err()
            {
                return Err(ConnectRejection::new(
                    ReasonCode::PAYLOAD_FORMAT_INVALID,
                    "will payload is not UTF-8",
                ));
            }
        }

        if connect.properties.authentication_method.is_some() {
            return Err(ConnectRejection::new(
                ReasonCode::BAD_AUTHENTICATION_METHOD,
                "enhanced authentication is not supported",
            ));
        }
        Ok(())
    }

    /// Admits a client.
    ///
    /// Nothing is created or changed unless validation and authentication
    /// pass. If another connection owns the client id, this waits until it
    /// has been told to go ("session taken over") and released the
    /// session, so callers should bound it with the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectRejection`] whose [`connack`](ConnectRejection::connack)
    /// should be sent before closing.
    pub async fn connect(&self, connect: Connect) -> Result<Accepted, ConnectRejection> {
        self.validate(&connect)?;

        let accepted = self
            .authenticator
            .authenticate(connect.username.as_deref(), connect.password.as_deref())
            .await;
        if !accepted {
            tracing::info!(client_id = %connect.client_id, "authentication failed");
            return Err(ConnectRejection::new(
                ReasonCode::BAD_USER_NAME_OR_PASSWORD,
                "bad user name or password",
            ));
        }

        let version = connect.protocol_version;
        let v5 = version.is_v5();
        let protocol = self.config.for_version(version).clone();
        let assigned = connect.client_id.is_empty().then(|| self.client_ids.next_id());
        let client_id: Arc<str> = Arc::from(assigned.as_deref().unwrap_or(&connect.client_id));
        let limits = negotiate(&connect, &protocol);

        let lease = self.sessions.lease(&client_id).acquire().await;
        let now = Instant::now();

        if connect.clean_start {
            // The stored session ends here, so its will is due now.
            if let Some(previous) = self.sessions.get(&client_id) {
                self.publish_will(&previous);
            }
        }
        let (session, present) = self.sessions.create_or_resume(
            &client_id,
            connect.clean_start,
            now,
            || SessionState::new(client_id.clone(), version, limits),
        );
        if present {
            session.reconfigure(version, limits);
            session.will().discard();
        }

        let requested_expiry = if v5 {
            connect.properties.session_expiry_interval.unwrap_or(0)
        } else if connect.clean_start {
            0
        } else {
            u32::MAX
        };
        let expiry = requested_expiry.min(self.config.max_session_expiry);
        session.set_session_expiry(expiry);

        if let Some(will) = &connect.will {
            let delay = if v5 {
                will.properties.will_delay_interval.unwrap_or(0)
            } else {
                0
            };
            session
                .will()
                .arm(Message::from_will(will, now), Duration::from_secs(u64::from(delay)));
        }

        let mut keep_alive = connect.keep_alive;
        let mut server_keep_alive = None;
        if v5 && keep_alive == 0 {
            if let Some(default) = self.config.default_keep_alive {
                keep_alive = default;
                server_keep_alive = Some(default);
            }
        }

        let mut properties = Properties::default();
        if v5 {
            properties.receive_maximum = u16::try_from(limits.max_receive).ok();
            properties.topic_alias_maximum =
                (limits.inbound_alias_max > 0).then_some(limits.inbound_alias_max);
            properties.maximum_packet_size = Some(protocol.max_packet_size);
            properties.assigned_client_identifier = assigned;
            properties.server_keep_alive = server_keep_alive;
            properties.session_expiry_interval =
                (expiry != requested_expiry).then_some(expiry);
            properties.retain_available = Some(0);
            properties.wildcard_subscription_available = Some(1);
            properties.subscription_identifier_available = Some(1);
            properties.shared_subscription_available = Some(0);
        }

        let client_max_packet_size = connect
            .properties
            .maximum_packet_size
            .and_then(|max| usize::try_from(max).ok())
            .unwrap_or(usize::MAX);

        tracing::info!(
            client_id = %client_id,
            %version,
            session_present = present,
            keep_alive,
            session_expiry = expiry,
            "client connected"
        );

        Ok(Accepted {
            session,
            lease,
            connack: ConnAck {
                session_present: present,
                reason_code: ReasonCode::SUCCESS,
                properties,
            },
            version,
            keep_alive: Duration::from_secs(u64::from(keep_alive)),
            client_max_packet_size,
            protocol,
        })
    }

    // -- subscriptions --------------------------------------------------------

    /// Applies a SUBSCRIBE to `session` and returns the SUBACK.
    ///
    /// Each filter is handled on its own: invalid filters and shared
    /// subscriptions are refused while the rest are granted at the
    /// requested QoS. 3.x clients only learn "failure" (`0x80`).
    pub fn subscribe(&self, session: &SessionState, subscribe: &Subscribe) -> SubAck {
        let v5 = session.version().is_v5();
        let identifier = subscribe.properties.subscription_identifiers.first().copied();

        let reason_codes: Vec<ReasonCode> = subscribe
            .filters
            .iter()
            .map(|request| {
                let refusal = if !is_valid_filter(&request.filter) {
                    ReasonCode::TOPIC_FILTER_INVALID
                } else if is_shared_subscription(&request.filter) {
                    ReasonCode::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED
                } else {
                    session.subscriptions().upsert(Subscription {
                        filter: request.filter.clone(),
                        options: request.options,
                        identifier,
                    });
                    return ReasonCode::granted(request.options.qos);
                };
                if v5 { refusal } else { ReasonCode::UNSPECIFIED_ERROR }
            })
            .collect();

        tracing::debug!(
            client_id = %session.client_id(),
            filters = subscribe.filters.len(),
            "subscribe"
        );
        self.observer
            .on_subscribe(session.client_id(), subscribe, &reason_codes);

        SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }
    }

    /// Removes the listed filters from `session` and returns the UNSUBACK.
    pub fn unsubscribe(&self, session: &SessionState, unsubscribe: &Unsubscribe) -> UnsubAck {
        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|filter| {
                if session.subscriptions().remove(filter) {
                    ReasonCode::SUCCESS
                } else {
                    ReasonCode::NO_SUBSCRIPTION_EXISTED
                }
            })
            .collect();

        tracing::debug!(
            client_id = %session.client_id(),
            filters = unsubscribe.filters.len(),
            "unsubscribe"
        );
        self.observer.on_unsubscribe(session.client_id(), unsubscribe);

        UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }
    }

    // -- routing --------------------------------------------------------------

    /// Queues `message` for every session with a matching subscription
    /// and returns how many sessions received it.
    ///
    /// `sender` is the publishing client's id (for No Local); `None` for
    /// wills. Each recipient gets its own copy with QoS and retain capped
    /// by its subscription. QoS 0 messages for disconnected sessions are
    /// dropped. Never waits on a recipient.
    pub fn dispatch(&self, message: &Message, sender: Option<&str>) -> usize {
        self.observer.on_message(sender, message);

        let mut delivered = 0;
        for session in self.sessions.snapshot() {
            let from_self = sender.is_some_and(|id| id == &**session.client_id());
            let Some(matched) = session.subscriptions().matches(&message.topic, from_self) else {
                continue;
            };
            let copy = message.for_subscriber(
                matched.qos,
                matched.retain_as_published,
                matched.subscription_ids,
            );
            if copy.qos == QoS::AtMostOnce && !session.is_active() {
                continue;
            }
            self.observer.on_deliver(session.client_id(), &copy);
            if session.enqueue(copy) {
                delivered += 1;
            }
        }

        tracing::trace!(
            topic = %String::from_utf8_lossy(&message.topic),
            delivered,
            "message dispatched"
        );
        delivered
    }

    // -- teardown -------------------------------------------------------------

    /// Ends the connection's hold on `session`.
    ///
    /// The session is marked disconnected. Unless the client disconnected
    /// normally, its will is published once `min(will delay, session
    /// expiry)` has passed. A session with expiry 0 is removed right away;
    /// any other waits for the sweeper.
    pub fn release(self: &Arc<Self>, session: &Arc<SessionState>, kind: DisconnectKind) {
        session.deactivate(Instant::now());
        let expiry = session.session_expiry();

        if kind == DisconnectKind::Normal {
            session.will().discard();
        } else if let Some((generation, delay)) = session.will().armed() {
            let delay = delay.min(Duration::from_secs(u64::from(expiry)));
            if delay.is_zero() {
                if let Some(will) = session.will().try_take(generation) {
                    self.dispatch(&will, None);
                }
            } else {
                self.schedule_will(session, generation, delay);
            }
        }

        if expiry == 0 {
            self.sessions.remove(session);
        }
        tracing::info!(client_id = %session.client_id(), ?kind, expiry, "session released");
    }

    fn schedule_will(self: &Arc<Self>, session: &Arc<SessionState>, generation: u64, delay: Duration) {
        let hub: Weak<Self> = Arc::downgrade(self);
        let session = Arc::clone(session);
        tracing::debug!(client_id = %session.client_id(), ?delay, "will scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(hub) = hub.upgrade() else {
                return;
            };
            if let Some(will) = session.will().try_take(generation) {
                hub.dispatch(&will, None);
            }
        });
    }

    /// Publishes the armed will of `session` now, if it still has one.
    fn publish_will(&self, session: &SessionState) -> bool {
        let Some((generation, _)) = session.will().armed() else {
            return false;
        };
        match session.will().try_take(generation) {
            Some(will) => {
                self.dispatch(&will, None);
                true
            }
            None => false,
        }
    }

    /// Destroys every disconnected session whose expiry interval has
    /// elapsed, publishing any will still pending. Returns how many were
    /// destroyed.
    pub fn expire_sessions(&self) -> usize {
        let expired = self.sessions.expire_stale(Instant::now());
        for session in &expired {
            self.publish_will(session);
            tracing::info!(client_id = %session.client_id(), "session expired");
        }
        expired.len()
    }

    /// Runs [`expire_sessions`](Self::expire_sessions) every `period`
    /// until the hub is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let expired = hub.expire_sessions();
                if expired > 0 {
                    tracing::debug!(expired, "expiry sweep");
                }
            }
        })
    }
}

/// The session limits for one connection: broker configuration combined
/// with what a 5.0 client announced.
fn negotiate(connect: &Connect, protocol: &ProtocolConfig) -> SessionLimits {
    let v5 = connect.protocol_version.is_v5();
    let client_receive = connect.properties.receive_maximum.unwrap_or(u16::MAX);
    let client_aliases = connect.properties.topic_alias_maximum.unwrap_or(0);
    SessionLimits {
        max_in_flight: usize::from(protocol.max_in_flight.min(client_receive).max(1)),
        max_receive: usize::from(protocol.max_receive.max(1)),
        inbound_alias_max: if v5 { protocol.topic_alias_max } else { 0 },
        outbound_alias_max: if v5 {
            client_aliases.min(protocol.client_topic_alias_maximum)
        } else {
            0
        },
        alias_size_threshold: protocol.topic_alias_size_threshold,
    }
}
