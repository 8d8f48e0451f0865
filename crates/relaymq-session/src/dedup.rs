//! Receive-side QoS 2 duplicate suppression.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::SessionError;

/// Outcome of recording an inbound QoS 2 packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First time this id was seen: deliver the message, then PUBREC.
    New,
    /// Redelivery before PUBREL: PUBREC again, don't deliver.
    Duplicate,
}

/// Packet ids of QoS 2 publishes received but not yet released by PUBREL.
///
/// Bounded by the Receive Maximum the broker advertises; a client that
/// exceeds it is in breach of the protocol.
#[derive(Debug)]
pub struct ReceiveWindow {
    inner: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    ids: HashSet<u16>,
    capacity: usize,
}

impl ReceiveWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Window {
                ids: HashSet::new(),
                capacity,
            }),
        }
    }

    /// Applies a new Receive Maximum on reconnect. Ids already recorded
    /// stay recorded.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
    }

    pub fn record(&self, packet_id: u16) -> Result<Receipt, SessionError> {
        let mut window = self.inner.lock();
        if window.ids.contains(&packet_id) {
            return Ok(Receipt::Duplicate);
        }
        if window.ids.len() >= window.capacity {
            return Err(SessionError::ReceiveMaximumExceeded(window.capacity));
        }
        window.ids.insert(packet_id);
        Ok(Receipt::New)
    }

    /// Handles PUBREL. Returns `false` if the id was not recorded.
    pub fn release(&self, packet_id: u16) -> bool {
        self.inner.lock().ids.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_duplicate_before_release() {
        let window = ReceiveWindow::new(4);
        assert_eq!(window.record(7), Ok(Receipt::New));
        assert_eq!(window.record(7), Ok(Receipt::Duplicate));
        assert!(window.release(7));
        assert_eq!(window.record(7), Ok(Receipt::New));
    }

    #[test]
    fn test_record_beyond_capacity_is_error() {
        let window = ReceiveWindow::new(2);
        window.record(1).unwrap();
        window.record(2).unwrap();
        assert_eq!(window.record(3), Err(SessionError::ReceiveMaximumExceeded(2)));
        // A duplicate of a held id is still fine at capacity.
        assert_eq!(window.record(2), Ok(Receipt::Duplicate));
    }

    #[test]
    fn test_release_unknown_id() {
        let window = ReceiveWindow::new(1);
        assert!(!window.release(9));
        assert!(window.is_empty());
    }
}
