//! A session's subscription table.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use relaymq_protocol::topic::topic_matches;
use relaymq_protocol::{QoS, SubscriptionOptions};

/// One entry in a subscription table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: Bytes,
    pub options: SubscriptionOptions,
    /// The 5.0 Subscription Identifier sent with the SUBSCRIBE, if any.
    pub identifier: Option<u32>,
}

/// What one session wants from a published topic: the aggregate of all
/// its matching subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMatch {
    /// Strongest QoS granted by any matching subscription.
    pub qos: QoS,
    pub retain_as_published: bool,
    pub subscription_ids: Vec<u32>,
}

/// Subscriptions keyed by exact filter bytes.
///
/// Lookups are a linear scan over the session's filters; the lock is held
/// only for the duration of one scan or one update.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: Mutex<HashMap<Bytes, Subscription>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the subscription for `subscription.filter`.
    ///
    /// Returns `true` when an existing subscription was replaced.
    pub fn upsert(&self, subscription: Subscription) -> bool {
        self.entries
            .lock()
            .insert(subscription.filter.clone(), subscription)
            .is_some()
    }

    /// Returns `true` if a subscription existed.
    pub fn remove(&self, filter: &[u8]) -> bool {
        self.entries.lock().remove(filter).is_some()
    }

    pub fn get(&self, filter: &[u8]) -> Option<Subscription> {
        self.entries.lock().get(filter).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Matches `topic` against every filter.
    ///
    /// `from_self` is `true` when this session published the message;
    /// subscriptions with No Local set are then skipped.
    pub fn matches(&self, topic: &[u8], from_self: bool) -> Option<SubscriptionMatch> {
        let entries = self.entries.lock();
        let mut result: Option<SubscriptionMatch> = None;
        for sub in entries.values() {
            if from_self && sub.options.no_local {
                continue;
            }
            if !topic_matches(topic, &sub.filter) {
                continue;
            }
            let aggregate = result.get_or_insert_with(|| SubscriptionMatch {
                qos: QoS::AtMostOnce,
                retain_as_published: false,
                subscription_ids: Vec::new(),
            });
            aggregate.qos = aggregate.qos.max(sub.options.qos);
            aggregate.retain_as_published |= sub.options.retain_as_published;
            if let Some(id) = sub.identifier {
                aggregate.subscription_ids.push(id);
            }
        }
        if let Some(aggregate) = &mut result {
            aggregate.subscription_ids.sort_unstable();
        }
        result
    }
}
