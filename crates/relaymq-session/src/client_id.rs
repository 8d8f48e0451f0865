//! Client identifiers assigned by the broker.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Hands out ids for clients that connect with an empty client id.
///
/// Ids look like `auto-3f9c01aa-17`: a random per-generator prefix, so
/// two broker processes don't collide, followed by a counter.
#[derive(Debug)]
pub struct ClientIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl ClientIdGenerator {
    pub fn new() -> Self {
        let bytes: [u8; 4] = rand::rng().random();
        let prefix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self::with_prefix(prefix)
    }

    /// A generator with a fixed prefix, for deterministic tests.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("auto-{}-{n}", self.prefix)
    }
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
