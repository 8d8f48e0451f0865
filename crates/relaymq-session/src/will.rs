//! The will message holder.
//!
//! A will may be published from several places: the connection teardown
//! path, a delay timer, or the session expiry sweeper. It may also be
//! discarded by a clean DISCONNECT or a resuming client. The holder makes
//! sure exactly one of those wins:
//!
//! ```text
//!   Armed ──try_take (CAS)──→ Publishing ──→ Done
//!     │
//!     └──discard──→ Done
//! ```
//!
//! Each [`WillSlot::arm`] returns a generation number. A timer armed for
//! one will can never publish a later one, because [`WillSlot::try_take`]
//! checks the generation first.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::Message;

const DONE: u8 = 0;
const ARMED: u8 = 1;
const PUBLISHING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WillState {
    Armed,
    Publishing,
    Done,
}

#[derive(Debug, Default)]
struct Pending {
    message: Option<Message>,
    delay: Duration,
    generation: u64,
}

/// Holds at most one will message for a session.
#[derive(Debug, Default)]
pub struct WillSlot {
    state: AtomicU8,
    pending: Mutex<Pending>,
}

impl WillSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a will, replacing any previous one, and returns its
    /// generation.
    pub fn arm(&self, message: Message, delay: Duration) -> u64 {
        let mut pending = self.pending.lock();
        pending.generation += 1;
        pending.message = Some(message);
        pending.delay = delay;
        self.state.store(ARMED, Ordering::Release);
        pending.generation
    }

    /// Drops the armed will, if any. Returns `true` if one was dropped.
    pub fn discard(&self) -> bool {
        let mut pending = self.pending.lock();
        let discarded = self
            .state
            .compare_exchange(ARMED, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if discarded {
            pending.message = None;
        }
        discarded
    }

    /// Claims the will for publishing if it is still armed and belongs to
    /// `generation`. At most one caller ever gets the message.
    pub fn try_take(&self, generation: u64) -> Option<Message> {
        let mut pending = self.pending.lock();
        if pending.generation != generation {
            return None;
        }
        self.state
            .compare_exchange(ARMED, PUBLISHING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let message = pending.message.take();
        self.state.store(DONE, Ordering::Release);
        message
    }

    /// The generation and delay of the armed will.
    pub fn armed(&self) -> Option<(u64, Duration)> {
        let pending = self.pending.lock();
        (self.state() == WillState::Armed).then_some((pending.generation, pending.delay))
    }

    pub fn state(&self) -> WillState {
        match self.state.load(Ordering::Acquire) {
            ARMED => WillState::Armed,
            PUBLISHING => WillState::Publishing,
            _ => WillState::Done,
        }
    }
}
