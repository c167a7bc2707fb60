//! Presence tracking: live cursor positions and heartbeat liveness for the
//! participants of one session.
//!
//! Presence is ephemeral. It is never persisted and never acknowledged;
//! updates are last-write-wins per user. Liveness is driven by heartbeats,
//! where any command from a participant counts as one. The session actor
//! runs the eviction sweep on its own timer so membership events stay
//! totally ordered with everything else in the session.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{CursorPosition, UserId};

/// Default liveness window before a silent participant is evicted.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct PresenceEntry {
    position: Option<CursorPosition>,
    last_heartbeat: Instant,
}

/// Per-session presence table. Single-owner, mutated only by the session
/// actor.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<UserId, PresenceEntry>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.entries.contains_key(user)
    }

    /// Start tracking a user. Re-joining resets liveness and clears any
    /// stale cursor from a previous connection.
    pub fn join(&mut self, user: UserId) {
        self.entries.insert(
            user,
            PresenceEntry {
                position: None,
                last_heartbeat: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, user: &UserId) -> bool {
        self.entries.remove(user).is_some()
    }

    /// Last-write-wins cursor update. Also counts as a heartbeat. Updates
    /// from users that already left are dropped.
    pub fn update(&mut self, user: &UserId, position: CursorPosition) -> bool {
        match self.entries.get_mut(user) {
            Some(entry) => {
                entry.position = Some(position);
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn heartbeat(&mut self, user: &UserId) -> bool {
        match self.entries.get_mut(user) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn position(&self, user: &UserId) -> Option<CursorPosition> {
        self.entries.get(user).and_then(|e| e.position)
    }

    /// Evict every user whose last heartbeat is older than the timeout.
    /// Returns the evicted ids so the caller can broadcast leaves.
    pub fn sweep(&mut self) -> Vec<UserId> {
        let now = Instant::now();
        let timeout = self.timeout;
        let expired: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) >= timeout)
            .map(|(u, _)| *u)
            .collect();
        for user in &expired {
            self.entries.remove(user);
        }
        expired
    }
}
