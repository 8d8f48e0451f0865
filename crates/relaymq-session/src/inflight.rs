//! Send-side QoS 1/2 delivery tracking.
//!
//! Every QoS 1 or 2 message sent to a client occupies one in-flight slot
//! until the client finishes acknowledging it:
//!
//! ```text
//! QoS 1:  Sent ──PUBACK──→ released
//! QoS 2:  Sent ──PUBREC──→ AwaitingPubComp ──PUBCOMP──→ released
//!                          (PUBREL sent)
//! ```
//!
//! Slots are counted by a semaphore sized to the negotiated in-flight
//! limit. The publisher takes a permit before sending (and `forget`s it),
//! and the ack path returns exactly one permit when an entry is released.
//! After the window shrinks below the number of entries in flight, the
//! first releases pay off that overshoot instead of adding permits.
//! Acks for unknown ids, or for entries in the wrong state, change
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use relaymq_protocol::QoS;
use tokio::sync::Semaphore;

use crate::{Message, SessionError};

/// Where a tracked packet id is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// PUBLISH sent, waiting for PUBACK (QoS 1) or PUBREC (QoS 2).
    Sent,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingPubComp,
}

/// What to send after a PUBREC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubRecAction {
    /// Answer with PUBREL (also for a duplicate PUBREC).
    SendPubRel,
    /// The client refused the message with an error reason code; the
    /// slot was released and the exchange is over.
    Released,
    /// No QoS 2 delivery uses this id.
    Unknown,
}

/// Something to resend when a session is resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retransmit {
    /// PUBLISH again with DUP set.
    Publish { packet_id: u16, message: Message },
    /// PUBREL again.
    PubRel { packet_id: u16 },
}

#[derive(Debug)]
struct Entry {
    message: Message,
    state: InflightState,
    /// Send order, so retransmission preserves it.
    seq: u64,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<u16, Entry>,
    next_id: u16,
    next_seq: u64,
}

#[derive(Debug)]
struct Window {
    limit: usize,
    /// Releases still to swallow after a shrink.
    deficit: usize,
}

/// The send-side in-flight window of one session.
#[derive(Debug)]
pub struct InflightTracker {
    inner: Mutex<Inner>,
    permits: Mutex<Arc<Semaphore>>,
    window: Mutex<Window>,
}

impl InflightTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 1,
                next_seq: 0,
            }),
            permits: Mutex::new(Arc::new(Semaphore::new(limit))),
            window: Mutex::new(Window { limit, deficit: 0 }),
        }
    }

    /// Changes the window size, e.g. to the Receive Maximum of a client
    /// resuming this session. Must only be called while no sender is
    /// waiting, i.e. between connections.
    ///
    /// Entries still in flight keep their slots. If there are more of
    /// them than the new limit, no slot frees up until enough of them
    /// are released.
    pub fn resize(&self, limit: usize) {
        let inner = self.inner.lock();
        let outstanding = inner.entries.len();
        let mut window = self.window.lock();
        *self.permits.lock() = Arc::new(Semaphore::new(limit.saturating_sub(outstanding)));
        *window = Window {
            limit,
            deficit: outstanding.saturating_sub(limit),
        };
    }

    pub fn limit(&self) -> usize {
        self.window.lock().limit
    }

    /// Waits for a free slot.
    ///
    /// The slot stays taken until [`InflightTracker::register`]'s entry
    /// is released by an ack.
    pub async fn acquire(&self) -> Result<(), SessionError> {
        let permits = self.permits.lock().clone();
        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| SessionError::InflightClosed)?;
        permit.forget();
        Ok(())
    }

    /// Records a message about to be sent and assigns its packet id.
    ///
    /// Ids cycle through 1..=65535, skipping ids that are still in use.
    /// The caller must hold a slot from [`InflightTracker::acquire`].
    pub fn register(&self, message: Message) -> Result<u16, SessionError> {
        let mut inner = self.inner.lock();
        let mut candidate = inner.next_id;
        for _ in 0..u16::MAX {
            if !inner.entries.contains_key(&candidate) {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.next_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
                inner.entries.insert(
                    candidate,
                    Entry {
                        message,
                        state: InflightState::Sent,
                        seq,
                    },
                );
                return Ok(candidate);
            }
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
        }
        Err(SessionError::PacketIdsExhausted)
    }

    /// Returns a slot taken by [`InflightTracker::acquire`] that ended up
    /// unused (e.g. the message expired or could not be encoded).
    pub fn release_unused(&self) {
        let mut window = self.window.lock();
        if window.deficit > 0 {
            window.deficit -= 1;
        } else {
            self.permits.lock().add_permits(1);
        }
    }

    /// Drops an entry that will never be acknowledged (its PUBLISH was
    /// too large for the client) and frees its slot.
    pub fn abandon(&self, packet_id: u16) -> bool {
        self.release_if(packet_id, |_| true)
    }

    /// Handles PUBACK. Returns `true` if it released a slot.
    pub fn on_puback(&self, packet_id: u16) -> bool {
        self.release_if(packet_id, |entry| {
            entry.state == InflightState::Sent && entry.message.qos == QoS::AtLeastOnce
        })
    }

    /// Handles PUBREC. `refused` is set for a 5.0 error reason code.
    pub fn on_pubrec(&self, packet_id: u16, refused: bool) -> PubRecAction {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&packet_id) else {
            return PubRecAction::Unknown;
        };
        if entry.message.qos != QoS::ExactlyOnce {
            return PubRecAction::Unknown;
        }
        if refused && entry.state == InflightState::Sent {
            inner.entries.remove(&packet_id);
            drop(inner);
            self.release_unused();
            return PubRecAction::Released;
        }
        entry.state = InflightState::AwaitingPubComp;
        PubRecAction::SendPubRel
    }

    /// Handles PUBCOMP. Returns `true` if it released a slot.
    pub fn on_pubcomp(&self, packet_id: u16) -> bool {
        self.release_if(packet_id, |entry| entry.state == InflightState::AwaitingPubComp)
    }

    fn release_if(&self, packet_id: u16, accept: impl FnOnce(&Entry) -> bool) -> bool {
        let mut inner = self.inner.lock();
        let accepted = inner.entries.get(&packet_id).is_some_and(accept);
        if accepted {
            inner.entries.remove(&packet_id);
            drop(inner);
            self.release_unused();
        }
        accepted
    }

    pub fn state(&self, packet_id: u16) -> Option<InflightState> {
        self.inner.lock().entries.get(&packet_id).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.lock().available_permits()
    }

    /// Everything to resend on resumption, in original send order.
    pub fn pending_retransmits(&self) -> Vec<Retransmit> {
        let inner = self.inner.lock();
        let mut pending: Vec<(u64, Retransmit)> = inner
            .entries
            .iter()
            .map(|(&packet_id, entry)| {
                let action = match entry.state {
                    InflightState::Sent => Retransmit::Publish {
                        packet_id,
                        message: entry.message.clone(),
                    },
                    InflightState::AwaitingPubComp => Retransmit::PubRel { packet_id },
                };
                (entry.seq, action)
            })
            .collect();
        pending.sort_unstable_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, action)| action).collect()
    }
}
