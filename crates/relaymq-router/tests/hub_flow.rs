//! Integration tests for the protocol hub: admission, takeover and
//! fan-out across several sessions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use relaymq_protocol::{
    Connect, Properties, ProtocolVersion, QoS, ReasonCode, Subscribe, SubscribeFilter,
    SubscriptionOptions,
};
use relaymq_router::{BrokerConfig, BrokerObserver, DisconnectKind, ProtocolHub};
use relaymq_session::{AllowAll, Authenticator, Message};

// =========================================================================
// Helpers
// =========================================================================

/// Accepts only `user` / `secret`.
struct PasswordCheck;

impl Authenticator for PasswordCheck {
    async fn authenticate(&self, username: Option<&str>, password: Option<&[u8]>) -> bool {
        username == Some("user") && password == Some(b"secret".as_slice())
    }
}

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<(Option<String>, Bytes)>>,
    subscribes: Mutex<Vec<Vec<ReasonCode>>>,
}

impl BrokerObserver for Recorder {
    fn on_message(&self, sender: Option<&str>, message: &Message) {
        self.messages
            .lock()
            .unwrap()
            .push((sender.map(str::to_string), message.topic.clone()));
    }

    fn on_subscribe(&self, _client_id: &str, _subscribe: &Subscribe, results: &[ReasonCode]) {
        self.subscribes.lock().unwrap().push(results.to_vec());
    }
}

fn connect(client_id: &str, clean_start: bool, expiry: u32) -> Connect {
    Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: client_id.to_string(),
        clean_start,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
        properties: Properties {
            session_expiry_interval: Some(expiry),
            ..Properties::default()
        },
    }
}

fn subscribe(filter: &'static str, qos: QoS) -> Subscribe {
    Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter {
            filter: Bytes::from_static(filter.as_bytes()),
            options: SubscriptionOptions::with_qos(qos),
        }],
        properties: Properties::default(),
    }
}

// =========================================================================
// Admission
// =========================================================================

#[tokio::test]
async fn test_failed_authentication_touches_no_session_state() {
    let hub = ProtocolHub::new(BrokerConfig::default(), PasswordCheck);

    let mut bad = connect("dev", false, 60);
    bad.username = Some("user".into());
    bad.password = Some(Bytes::from_static(b"wrong"));
    let rejection = hub.connect(bad).await.unwrap_err();
    assert_eq!(rejection.reason_code, ReasonCode::BAD_USER_NAME_OR_PASSWORD);
    assert!(hub.sessions().is_empty());

    let mut good = connect("dev", false, 60);
    good.username = Some("user".into());
    good.password = Some(Bytes::from_static(b"secret"));
    assert!(hub.connect(good).await.is_ok());
    assert_eq!(hub.sessions().len(), 1);
}

#[tokio::test]
async fn test_second_connect_takes_over_and_resumes_session() {
    let hub = Arc::new(ProtocolHub::new(BrokerConfig::default(), AllowAll));
    let first = hub.connect(connect("dev", false, 300)).await.unwrap();
    hub.subscribe(&first.session, &subscribe("a/#", QoS::AtLeastOnce));

    let second = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.connect(connect("dev", false, 300)).await })
    };

    // The owner is told someone else wants the session, then lets go.
    tokio::time::timeout(Duration::from_secs(1), first.lease.contended())
        .await
        .expect("owner notified of takeover");
    assert!(!second.is_finished());
    hub.release(&first.session, DisconnectKind::Abnormal);
    let old_session = first.session.clone();
    drop(first);

    let second = second.await.unwrap().unwrap();
    assert!(second.connack.session_present);
    assert!(Arc::ptr_eq(&second.session, &old_session));
    assert!(second.session.is_active());
    assert_eq!(second.session.subscriptions().len(), 1);
}

#[tokio::test]
async fn test_takeover_still_signalled_after_expiry_sweep() {
    let hub = Arc::new(ProtocolHub::new(BrokerConfig::default(), AllowAll));
    let first = hub.connect(connect("dev", false, 300)).await.unwrap();

    assert_eq!(hub.expire_sessions(), 0);

    let second = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.connect(connect("dev", false, 300)).await })
    };
    tokio::time::timeout(Duration::from_secs(1), first.lease.contended())
        .await
        .expect("owner notified of takeover after a sweep");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished());

    hub.release(&first.session, DisconnectKind::Abnormal);
    drop(first);
    let second = second.await.unwrap().unwrap();
    assert!(second.connack.session_present);
}

#[tokio::test]
async fn test_clean_start_replaces_stored_session() {
    let hub = Arc::new(ProtocolHub::new(BrokerConfig::default(), AllowAll));
    let first = hub.connect(connect("dev", false, 300)).await.unwrap();
    hub.subscribe(&first.session, &subscribe("a/#", QoS::AtLeastOnce));
    hub.release(&first.session, DisconnectKind::Normal);
    drop(first);

    let second = hub.connect(connect("dev", true, 300)).await.unwrap();
    assert!(!second.connack.session_present);
    assert!(second.session.subscriptions().is_empty());
    assert_eq!(hub.sessions().len(), 1);
}

// =========================================================================
// Fan-out
// =========================================================================

#[tokio::test]
async fn test_dispatch_reaches_each_matching_session_once() {
    let recorder = Arc::new(Recorder::default());
    let hub = Arc::new(
        ProtocolHub::new(BrokerConfig::default(), AllowAll).with_observer(recorder.clone()),
    );

    let a = hub.connect(connect("a", true, 0)).await.unwrap();
    let b = hub.connect(connect("b", true, 0)).await.unwrap();
    let c = hub.connect(connect("c", true, 0)).await.unwrap();
    hub.subscribe(&a.session, &subscribe("sensors/+/temp", QoS::AtLeastOnce));
    // Two overlapping filters still deliver one copy, at the stronger QoS.
    hub.subscribe(&b.session, &subscribe("sensors/#", QoS::AtMostOnce));
    hub.subscribe(&b.session, &subscribe("sensors/1/temp", QoS::ExactlyOnce));
    hub.subscribe(&c.session, &subscribe("other", QoS::AtMostOnce));

    let message = Message::new("sensors/1/temp", "21.5", QoS::ExactlyOnce, false);
    assert_eq!(hub.dispatch(&message, Some("c")), 2);

    let mut queue_a = a.session.take_outgoing().unwrap();
    let mut queue_b = b.session.take_outgoing().unwrap();
    assert_eq!(queue_a.recv().await.unwrap().qos, QoS::AtLeastOnce);
    assert_eq!(queue_b.recv().await.unwrap().qos, QoS::ExactlyOnce);
    assert!(queue_b.try_recv().is_err());
    assert!(c.session.take_outgoing().unwrap().try_recv().is_err());

    let seen = recorder.messages.lock().unwrap().clone();
    assert_eq!(seen, vec![(Some("c".to_string()), Bytes::from_static(b"sensors/1/temp"))]);
    assert_eq!(recorder.subscribes.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_released_session_keeps_qos1_messages_until_resumed() {
    let hub = Arc::new(ProtocolHub::new(BrokerConfig::default(), AllowAll));
    let first = hub.connect(connect("dev", false, 300)).await.unwrap();
    hub.subscribe(&first.session, &subscribe("jobs", QoS::AtLeastOnce));
    hub.release(&first.session, DisconnectKind::Normal);
    drop(first);

    assert_eq!(hub.dispatch(&Message::new("jobs", "one", QoS::AtLeastOnce, false), None), 1);
    assert_eq!(hub.dispatch(&Message::new("jobs", "lost", QoS::AtMostOnce, false), None), 0);

    let resumed = hub.connect(connect("dev", false, 300)).await.unwrap();
    let mut queue = resumed.session.take_outgoing().unwrap();
    assert_eq!(&queue.recv().await.unwrap().payload[..], b"one");
    assert!(queue.try_recv().is_err());
}
