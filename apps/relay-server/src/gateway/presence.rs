//! In-memory per-user presence tracking with multi-connection support.
//!
//! Presence is per-**user**, not per-connection. A user is online while at
//! least one of their connections is open, and offline the moment the last
//! one closes. Transitions are edge-triggered: one `Online` per 0→1 and one
//! `Offline` per 1→0, regardless of how many tabs come and go in between.

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::RwLock;
use relay_common::{ConnectionId, UserId};

/// A genuine change in a user's online status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Online(UserId),
    Offline(UserId),
}

type TransitionObserver = Box<dyn Fn(&PresenceTransition) + Send + Sync>;

/// Thread-safe, DashMap-backed presence registry.
///
/// Each user maps to the set of their open connection ids; the presence count
/// is the size of that set, so duplicate connects or disconnects for the same
/// connection id cannot skew it.
pub struct PresenceRegistry {
    inner: DashMap<UserId, HashSet<ConnectionId>>,
    observers: RwLock<Vec<TransitionObserver>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked on every online/offline transition.
    pub fn on_transition<F>(&self, observer: F)
    where
        F: Fn(&PresenceTransition) + Send + Sync + 'static,
    {
        self.observers.write().push(Box::new(observer));
    }

    /// Record an open connection. Returns `Online` if this was the user's
    /// first open connection.
    pub fn mark_connected(&self, user_id: &UserId, conn_id: &ConnectionId) -> Option<PresenceTransition> {
        let came_online = {
            let mut conns = self.inner.entry(user_id.clone()).or_default();
            let was_offline = conns.is_empty();
            conns.insert(conn_id.clone()) && was_offline
        };

        came_online.then(|| self.emit(PresenceTransition::Online(user_id.clone())))
    }

    /// Record a closed connection. Returns `Offline` if it was the user's last
    /// open connection. Unknown or already-removed connections are a no-op.
    pub fn mark_disconnected(&self, user_id: &UserId, conn_id: &ConnectionId) -> Option<PresenceTransition> {
        let now_empty = {
            let mut conns = self.inner.get_mut(user_id)?;
            if !conns.remove(conn_id) {
                return None;
            }
            conns.is_empty()
        };

        if !now_empty {
            return None;
        }
        self.inner.remove_if(user_id, |_, conns| conns.is_empty());
        Some(self.emit(PresenceTransition::Offline(user_id.clone())))
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.inner.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of a user's open connection ids.
    pub fn connections(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.inner
            .get(user_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of all users with at least one open connection.
    pub fn online_users(&self) -> Vec<UserId> {
        self.inner
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    fn emit(&self, transition: PresenceTransition) -> PresenceTransition {
        for observer in self.observers.read().iter() {
            observer(&transition);
        }
        transition
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
