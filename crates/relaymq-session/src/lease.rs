//! Per-client-id ownership lease.
//!
//! Only one connection may drive a client id's session at a time. A new
//! CONNECT for the same id first announces itself as a contender (which
//! wakes the current owner, whose engine then shuts down with "session
//! taken over") and then waits for the lease. Leases are handed out in
//! arrival order, so the most recent CONNECT ends up owning the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct Lease {
    lock: Arc<Mutex<()>>,
    contenders: AtomicUsize,
    changed: Notify,
}

/// Proof of ownership. Dropping it hands the session to the next
/// contender.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: Arc<Lease>,
    _guard: OwnedMutexGuard<()>,
}

/// Keeps the contender count honest when an acquire is cancelled (for
/// example by the connect timeout).
struct Contender<'a>(&'a Lease);

impl Drop for Contender<'_> {
    fn drop(&mut self) {
        self.0.contenders.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Lease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the current owner (if any) lets go.
    pub async fn acquire(self: &Arc<Self>) -> LeaseGuard {
        self.contenders.fetch_add(1, Ordering::AcqRel);
        let contender = Contender(self);
        self.changed.notify_waiters();
        let guard = self.lock.clone().lock_owned().await;
        drop(contender);
        LeaseGuard {
            lease: self.clone(),
            _guard: guard,
        }
    }

    /// `true` while someone holds or waits for the lease.
    pub fn in_use(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) > 1 || self.contenders.load(Ordering::Acquire) > 0
    }
}

impl LeaseGuard {
    /// Resolves once another connection wants this session.
    pub async fn contended(&self) {
        loop {
            let notified = self.lease.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lease.contenders.load(Ordering::Acquire) > 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_contended_fires_when_second_owner_arrives() {
        let lease = Arc::new(Lease::new());
        let first = lease.acquire().await;

        let waiting = {
            let lease = lease.clone();
            tokio::spawn(async move { lease.acquire().await })
        };

        tokio::time::timeout(Duration::from_secs(1), first.contended())
            .await
            .expect("owner notified");
        assert!(!waiting.is_finished());

        drop(first);
        let second = waiting.await.unwrap();
        // Nobody else is waiting for the new owner.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), second.contended())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_cancelled_acquire_is_not_a_contender() {
        let lease = Arc::new(Lease::new());
        let owner = lease.acquire().await;
        let attempt = tokio::time::timeout(Duration::from_millis(10), lease.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(lease.contenders.load(Ordering::Acquire), 0);
        drop(owner);
    }
}
