//! The broker-internal routed message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use relaymq_protocol::{Properties, Publish, QoS, Will};

/// One application message as it travels between sessions.
///
/// A `Message` is built once from the incoming PUBLISH (or will) and
/// then copied per recipient by [`Message::for_subscriber`]. `topic`,
/// `payload` and `properties` are reference counted, so the copies are
/// cheap regardless of payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Bytes,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Derived from the 5.0 Message Expiry Interval when published.
    pub expires_at: Option<Instant>,
    /// Identifiers of the recipient's matching subscriptions.
    pub subscription_ids: Vec<u32>,
    /// Forwardable 5.0 properties (topic alias and subscription
    /// identifiers stripped), `None` when there are none.
    pub properties: Option<Arc<Properties>>,
}

impl Message {
    pub fn new(topic: impl Into<Bytes>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            expires_at: None,
            subscription_ids: Vec::new(),
            properties: None,
        }
    }

    /// Builds a message from a PUBLISH whose topic alias was already
    /// resolved into `publish.topic`.
    pub fn from_publish(publish: &Publish, now: Instant) -> Self {
        Self::with_properties(
            publish.topic.clone(),
            publish.payload.clone(),
            publish.qos,
            publish.retain,
            &publish.properties,
            now,
        )
    }

    /// Builds the message published when a will fires.
    pub fn from_will(will: &Will, now: Instant) -> Self {
        let mut properties = will.properties.clone();
        properties.will_delay_interval = None;
        Self::with_properties(
            will.topic.clone(),
            will.payload.clone(),
            will.qos,
            will.retain,
            &properties,
            now,
        )
    }

    fn with_properties(
        topic: Bytes,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        properties: &Properties,
        now: Instant,
    ) -> Self {
        let expires_at = properties
            .message_expiry_interval
            .map(|secs| now + Duration::from_secs(u64::from(secs)));

        let mut forwarded = properties.clone();
        forwarded.topic_alias = None;
        forwarded.subscription_identifiers.clear();
        forwarded.message_expiry_interval = None;

        Self {
            topic,
            payload,
            qos,
            retain,
            expires_at,
            subscription_ids: Vec::new(),
            properties: (!forwarded.is_empty()).then(|| Arc::new(forwarded)),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// The copy delivered to one subscriber: QoS capped at the granted
    /// QoS, retain kept only for retain-as-published subscriptions.
    pub fn for_subscriber(
        &self,
        granted: QoS,
        retain_as_published: bool,
        subscription_ids: Vec<u32>,
    ) -> Self {
        Self {
            qos: self.qos.min(granted),
            retain: self.retain && retain_as_published,
            subscription_ids,
            ..self.clone()
        }
    }

    /// The PUBLISH that carries this message to a client.
    ///
    /// For 5.0 the forwarded Message Expiry Interval is the remaining
    /// lifetime, rounded up to whole seconds.
    pub fn to_publish(&self, packet_id: u16, dup: bool, v5: bool, now: Instant) -> Publish {
        let mut properties = Properties::default();
        if v5 {
            if let Some(props) = &self.properties {
                properties = Properties::clone(props);
            }
            if let Some(deadline) = self.expires_at {
                let remaining = deadline.saturating_duration_since(now);
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                properties.message_expiry_interval = Some(u32::try_from(secs).unwrap_or(u32::MAX));
            }
            properties.subscription_identifiers = self.subscription_ids.clone();
        }
        Publish {
            dup,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_with(properties: Properties) -> Publish {
        Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: true,
            topic: Bytes::from_static(b"a/x/c"),
            packet_id: 9,
            payload: Bytes::from_static(b"hi"),
            properties,
        }
    }

    #[test]
    fn test_for_subscriber_downgrades_qos_and_clears_retain() {
        let msg = Message::from_publish(&publish_with(Properties::default()), Instant::now());
        let copy = msg.for_subscriber(QoS::AtLeastOnce, false, vec![3]);
        assert_eq!(copy.qos, QoS::AtLeastOnce);
        assert!(!copy.retain);
        assert_eq!(copy.subscription_ids, vec![3]);
        assert!(msg.for_subscriber(QoS::ExactlyOnce, true, Vec::new()).retain);
    }

    #[test]
    fn test_from_publish_strips_alias_and_tracks_expiry() {
        let now = Instant::now();
        let msg = Message::from_publish(
            &publish_with(Properties {
                topic_alias: Some(3),
                message_expiry_interval: Some(10),
                subscription_identifiers: vec![1],
                content_type: Some("text/plain".into()),
                ..Properties::default()
            }),
            now,
        );
        assert_eq!(msg.expires_at, Some(now + Duration::from_secs(10)));
        let props = msg.properties.as_deref().expect("content type forwarded");
        assert_eq!(props.topic_alias, None);
        assert!(props.subscription_identifiers.is_empty());
        assert!(!msg.is_expired(now));
        assert!(msg.is_expired(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_from_publish_without_properties_keeps_none() {
        let msg = Message::from_publish(&publish_with(Properties::default()), Instant::now());
        assert!(msg.properties.is_none());
    }

    #[test]
    fn test_to_publish_forwards_remaining_expiry_rounded_up() {
        let now = Instant::now();
        let mut msg = Message::new("t", "p", QoS::AtLeastOnce, false);
        msg.expires_at = Some(now + Duration::from_millis(4_200));
        msg.subscription_ids = vec![7];

        let v5 = msg.to_publish(12, true, true, now);
        assert_eq!(v5.properties.message_expiry_interval, Some(5));
        assert_eq!(v5.properties.subscription_identifiers, vec![7]);
        assert!(v5.dup);
        assert_eq!(v5.packet_id, 12);

        let v3 = msg.to_publish(12, false, false, now);
        assert!(v3.properties.is_empty());
    }
}
