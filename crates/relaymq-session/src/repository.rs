//! The session repository: every session the broker knows, by client id.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::{Lease, SessionState};

/// Concurrent map of client id to session, plus the ownership leases
/// that serialize connections for the same id.
///
/// Dispatch takes a [`snapshot`](SessionRepository::snapshot) and
/// releases the map before matching, so a publish never holds a map lock
/// while it walks subscription tables.
#[derive(Debug, Default)]
pub struct SessionRepository {
    sessions: DashMap<Arc<str>, Arc<SessionState>>,
    leases: DashMap<Arc<str>, Arc<Lease>>,
}

impl SessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    /// The ownership lease for `client_id`, created on first use.
    pub fn lease(&self, client_id: &str) -> Arc<Lease> {
        if let Some(lease) = self.leases.get(client_id) {
            return lease.value().clone();
        }
        self.leases.entry(Arc::from(client_id)).or_default().value().clone()
    }

    /// Resumes the stored session for `client_id` or installs a new one
    /// built by `make`, and marks it active.
    ///
    /// Returns the session and whether an existing one was resumed
    /// ("session present"). A stored session is never resumed when
    /// `clean_start` is set or when it has already expired. The caller
    /// must hold the client id's [`Lease`].
    pub fn create_or_resume(
        &self,
        client_id: &str,
        clean_start: bool,
        now: Instant,
        make: impl FnOnce() -> SessionState,
    ) -> (Arc<SessionState>, bool) {
        if !clean_start {
            // Holding the entry keeps the expiry sweeper from removing it
            // between the check and the activation.
            if let Some(entry) = self.sessions.get(client_id) {
                let existing = entry.value();
                if !existing.is_expired(now) {
                    existing.activate();
                    return (existing.clone(), true);
                }
            }
        }

        let state = Arc::new(make());
        state.activate();
        self.sessions.insert(state.client_id().clone(), state.clone());
        (state, false)
    }

    /// Removes `session` if it is still the one stored under its id.
    pub fn remove(&self, session: &Arc<SessionState>) -> bool {
        self.sessions
            .remove_if(session.client_id(), |_, stored| Arc::ptr_eq(stored, session))
            .is_some()
    }

    /// Removes and returns every disconnected session whose expiry
    /// interval has elapsed. Leases nobody holds are dropped too.
    pub fn expire_stale(&self, now: Instant) -> Vec<Arc<SessionState>> {
        let candidates: Vec<Arc<SessionState>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();

        let expired: Vec<Arc<SessionState>> = candidates
            .into_iter()
            .filter(|session| {
                self.sessions
                    .remove_if(session.client_id(), |_, stored| {
                        Arc::ptr_eq(stored, session) && stored.is_expired(now)
                    })
                    .is_some()
            })
            .collect();

        // A lease stays while a connection holds or waits for it.
        self.leases.retain(|_, lease| lease.in_use());
        expired
    }

    /// All sessions at this instant.
    pub fn snapshot(&self) -> Vec<Arc<SessionState>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
