//! MQTT 5 topic aliases.
//!
//! An alias is a small integer standing in for a topic name, one table
//! per direction per connection. Both tables are rebuilt on every
//! CONNECT; nothing carries over from a previous connection.

use std::collections::HashMap;

use bytes::Bytes;

use crate::SessionError;

/// Client-to-broker aliases, capacity set by the broker's Topic Alias
/// Maximum.
#[derive(Debug, Default)]
pub struct InboundAliases {
    /// Index `alias - 1`.
    topics: Vec<Option<Bytes>>,
}

impl InboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            topics: vec![None; usize::from(maximum)],
        }
    }

    pub fn maximum(&self) -> u16 {
        self.topics.len() as u16
    }

    /// Resolves the topic of an incoming PUBLISH.
    ///
    /// A non-empty topic with an alias records (or overwrites) the
    /// mapping; an empty topic with an alias is replaced by the mapped
    /// topic. Without an alias the topic passes through.
    pub fn resolve(&mut self, alias: Option<u16>, topic: Bytes) -> Result<Bytes, SessionError> {
        let Some(alias) = alias else {
            return Ok(topic);
        };
        let slot = usize::from(alias)
            .checked_sub(1)
            .and_then(|index| self.topics.get_mut(index))
            .ok_or(SessionError::TopicAliasInvalid(alias))?;

        if topic.is_empty() {
            slot.clone().ok_or(SessionError::TopicAliasInvalid(alias))
        } else {
            *slot = Some(topic.clone());
            Ok(topic)
        }
    }
}

/// How to send a topic to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasDecision {
    /// Send the full topic, no alias.
    Unaliased,
    /// Send the full topic together with this newly assigned alias.
    Fresh(u16),
    /// The client knows this alias: send it with an empty topic.
    Known(u16),
}

/// Broker-to-client aliases, capacity set by the client's Topic Alias
/// Maximum and capped by configuration.
#[derive(Debug, Default)]
pub struct OutboundAliases {
    maximum: u16,
    /// Topics shorter than this are never aliased.
    threshold: usize,
    assigned: HashMap<Bytes, u16>,
}

impl OutboundAliases {
    pub fn new(maximum: u16, threshold: usize) -> Self {
        Self {
            maximum,
            threshold,
            assigned: HashMap::new(),
        }
    }

    pub fn decide(&mut self, topic: &Bytes) -> AliasDecision {
        if let Some(&alias) = self.assigned.get(topic) {
            return AliasDecision::Known(alias);
        }
        if self.maximum == 0 || topic.len() < self.threshold {
            return AliasDecision::Unaliased;
        }
        let used = self.assigned.len();
        if used >= usize::from(self.maximum) {
            return AliasDecision::Unaliased;
        }
        let alias = used as u16 + 1;
        self.assigned.insert(topic.clone(), alias);
        AliasDecision::Fresh(alias)
    }

    /// Takes back a [`AliasDecision::Fresh`] alias whose packet never
    /// reached the client. Only the most recent assignment can be undone.
    pub fn forget(&mut self, topic: &Bytes) {
        if self.assigned.get(topic).copied() == Some(self.assigned.len() as u16) {
            self.assigned.remove(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_records_then_substitutes() {
        let mut aliases = InboundAliases::new(2);
        let topic = Bytes::from_static(b"sensors/temp");
        assert_eq!(aliases.resolve(Some(1), topic.clone()).unwrap(), topic);
        assert_eq!(aliases.resolve(Some(1), Bytes::new()).unwrap(), topic);

        // Overwrite.
        let other = Bytes::from_static(b"sensors/rh");
        aliases.resolve(Some(1), other.clone()).unwrap();
        assert_eq!(aliases.resolve(Some(1), Bytes::new()).unwrap(), other);
    }

    #[test]
    fn test_inbound_rejects_unmapped_and_out_of_range() {
        let mut aliases = InboundAliases::new(2);
        assert_eq!(
            aliases.resolve(Some(2), Bytes::new()),
            Err(SessionError::TopicAliasInvalid(2))
        );
        assert_eq!(
            aliases.resolve(Some(0), Bytes::from_static(b"t")),
            Err(SessionError::TopicAliasInvalid(0))
        );
        assert_eq!(
            aliases.resolve(Some(3), Bytes::from_static(b"t")),
            Err(SessionError::TopicAliasInvalid(3))
        );
        assert!(InboundAliases::new(0).resolve(Some(1), Bytes::from_static(b"t")).is_err());
    }

    #[test]
    fn test_inbound_without_alias_passes_through() {
        let mut aliases = InboundAliases::new(0);
        let topic = Bytes::from_static(b"a");
        assert_eq!(aliases.resolve(None, topic.clone()).unwrap(), topic);
    }

    #[test]
    fn test_outbound_assigns_fresh_then_known_until_full() {
        let mut aliases = OutboundAliases::new(1, 4);
        let long = Bytes::from_static(b"long/topic");
        let other = Bytes::from_static(b"other/topic");
        assert_eq!(aliases.decide(&long), AliasDecision::Fresh(1));
        assert_eq!(aliases.decide(&long), AliasDecision::Known(1));
        assert_eq!(aliases.decide(&other), AliasDecision::Unaliased);
    }

    #[test]
    fn test_outbound_threshold_and_disabled() {
        let mut aliases = OutboundAliases::new(4, 8);
        assert_eq!(aliases.decide(&Bytes::from_static(b"a/b")), AliasDecision::Unaliased);
        let mut disabled = OutboundAliases::new(0, 0);
        assert_eq!(disabled.decide(&Bytes::from_static(b"a/b/c/d")), AliasDecision::Unaliased);
    }

    #[test]
    fn test_outbound_forget_undoes_fresh_assignment() {
        let mut aliases = OutboundAliases::new(2, 0);
        let topic = Bytes::from_static(b"x/y");
        assert_eq!(aliases.decide(&topic), AliasDecision::Fresh(1));
        aliases.forget(&topic);
        assert_eq!(aliases.decide(&topic), AliasDecision::Fresh(1));
    }
}
