//! Session / Presence Manager.
//!
//! Tracks which connections each user holds and derives a presence state:
//!
//! - `Offline -> Online` on the first connection.
//! - `Online -> Offline` once the last connection is gone and
//!   `offline_debounce` elapsed without a new one (zero means immediately).
//! - `Online <-> Away` when every connection is idle / any becomes active.
//!
//! Offline users keep their record (with `last_seen_at`) so `/presence` can
//! answer "last seen". Changes are published on a broadcast channel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::connection::{Connection, ConnectionId};
use super::dashmap_ext::DashMapExt;
use super::registry::ConnectionObserver;
use crate::metrics;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Away,
    Offline,
}

impl PresenceState {
    fn is_present(self) -> bool {
        self != PresenceState::Offline
    }
}

/// Snapshot of one user's session.
#[derive(Debug, Clone, Serialize)]
pub struct UserSession {
    pub user_id: String,
    pub connection_ids: Vec<ConnectionId>,
    pub leader_connection_id: Option<ConnectionId>,
    pub presence: PresenceState,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub previous: PresenceState,
    pub current: PresenceState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    connections: Vec<ConnectionId>,
    idle: HashSet<ConnectionId>,
    leader: Option<ConnectionId>,
    presence: PresenceState,
    last_seen_at: DateTime<Utc>,
    /// Bumped on every membership change; a pending offline timer only
    /// fires if the epoch it captured is still current.
    epoch: u64,
    /// Last membership change, for pruning.
    touched: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            connections: Vec::new(),
            idle: HashSet::new(),
            leader: None,
            presence: PresenceState::Offline,
            last_seen_at: Utc::now(),
            epoch: 0,
            touched: Instant::now(),
        }
    }

    fn derived(&self) -> PresenceState {
        if self.connections.is_empty() {
            PresenceState::Offline
        } else if self.connections.iter().all(|c| self.idle.contains(c)) {
            PresenceState::Away
        } else {
            PresenceState::Online
        }
    }

    /// Move to `next`, returning the transition if it changed anything.
    fn transition(&mut self, next: PresenceState) -> Option<(PresenceState, PresenceState)> {
        let previous = self.presence;
        if previous == next {
            return None;
        }
        self.presence = next;
        Some((previous, next))
    }
}

pub struct PresenceManager {
    sessions: DashMap<String, SessionEntry>,
    offline_debounce: Duration,
    events: broadcast::Sender<PresenceEvent>,
    me: Weak<PresenceManager>,
}

impl PresenceManager {
    pub fn new(offline_debounce: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            sessions: DashMap::new(),
            offline_debounce,
            events,
            me: me.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Presence of `user_id`. Unknown users are offline.
    pub fn get_presence(&self, user_id: &str) -> PresenceState {
        self.sessions
            .get(user_id)
            .map(|s| s.presence)
            .unwrap_or(PresenceState::Offline)
    }

    pub fn session(&self, user_id: &str) -> Option<UserSession> {
        self.sessions.get(user_id).map(|s| UserSession {
            user_id: user_id.to_string(),
            connection_ids: s.connections.clone(),
            leader_connection_id: s.leader.clone(),
            presence: s.presence,
            last_seen_at: s.last_seen_at,
        })
    }

    /// Users currently online or away.
    pub fn online_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.presence.is_present())
            .count()
    }

    /// Record which connection hosts the leader tab. `None` clears it.
    ///
    /// Returns `false` when the connection is not part of the user's session.
    pub fn set_leader(&self, user_id: &str, connection_id: Option<&ConnectionId>) -> bool {
        self.sessions
            .with_mut(user_id, |s| match connection_id {
                Some(id) if !s.connections.contains(id) => false,
                other => {
                    s.leader = other.cloned();
                    true
                }
            })
            .unwrap_or(connection_id.is_none())
    }

    pub fn add_connection(&self, user_id: &str, connection_id: &ConnectionId) {
        self.add(user_id, connection_id, || true);
    }

    /// Add `connection_id` unless `alive` reports it already removed.
    ///
    /// `alive` is checked under the session entry lock. Removal marks the
    /// connection closed before it takes that lock, so a late add for a
    /// removed connection is dropped instead of leaving a ghost member.
    fn add(&self, user_id: &str, connection_id: &ConnectionId, alive: impl Fn() -> bool) {
        let change = {
            let mut s = self
                .sessions
                .entry(user_id.to_string())
                .or_insert_with(SessionEntry::new);
            if !alive() {
                debug!(user_id = %user_id, connection_id = %connection_id, "skipping add for removed connection");
                return;
            }
            if !s.connections.contains(connection_id) {
                s.connections.push(connection_id.clone());
            }
            s.epoch += 1;
            s.touched = Instant::now();
            s.last_seen_at = Utc::now();
            let next = s.derived();
            s.transition(next)
        };
        self.publish(user_id, change);
    }

    pub fn remove_connection(&self, user_id: &str, connection_id: &ConnectionId) {
        let pending = self.sessions.with_mut(user_id, |s| {
            let before = s.connections.len();
            s.connections.retain(|c| c != connection_id);
            s.idle.remove(connection_id);
            if s.leader.as_ref() == Some(connection_id) {
                s.leader = None;
            }
            if s.connections.len() == before {
                return (None, None);
            }
            s.epoch += 1;
            s.touched = Instant::now();
            s.last_seen_at = Utc::now();

            if !s.connections.is_empty() {
                let next = s.derived();
                return (s.transition(next), None);
            }
            (None, Some(s.epoch))
        });

        let Some((change, offline_epoch)) = pending else {
            return;
        };
        self.publish(user_id, change);

        if let Some(epoch) = offline_epoch {
            self.schedule_offline(user_id, epoch);
        }
    }

    fn schedule_offline(&self, user_id: &str, epoch: u64) {
        if self.offline_debounce.is_zero() {
            self.finish_offline(user_id, epoch);
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.finish_offline(user_id, epoch);
            return;
        };
        let me = self.me.clone();
        let user_id = user_id.to_string();
        let delay = self.offline_debounce;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = me.upgrade() {
                manager.finish_offline(&user_id, epoch);
            }
        });
    }

    fn finish_offline(&self, user_id: &str, epoch: u64) {
        let change = self
            .sessions
            .with_mut(user_id, |s| {
                if s.epoch != epoch || !s.connections.is_empty() {
                    return None;
                }
                s.transition(PresenceState::Offline)
            })
            .flatten();
        self.publish(user_id, change);
    }

    /// Drop sessions that have been offline with no connections for at least
    /// `retention`. Returns how many were dropped.
    pub fn prune_offline(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| {
            !(s.connections.is_empty()
                && s.presence == PresenceState::Offline
                && now.saturating_duration_since(s.touched) >= retention)
        });
        let pruned = before.saturating_sub(self.sessions.len());
        if pruned > 0 {
            debug!(pruned, "offline sessions dropped");
        }
        pruned
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// A connection stopped sending client traffic.
    pub fn mark_idle(&self, user_id: &str, connection_id: &ConnectionId) {
        let change = self
            .sessions
            .with_mut(user_id, |s| {
                if !s.connections.contains(connection_id) {
                    return None;
                }
                s.idle.insert(connection_id.clone());
                let next = s.derived();
                s.transition(next)
            })
            .flatten();
        self.publish(user_id, change);
    }

    /// A connection sent client traffic again.
    pub fn mark_active(&self, user_id: &str, connection_id: &ConnectionId) {
        let change = self
            .sessions
            .with_mut(user_id, |s| {
                s.idle.remove(connection_id);
                s.last_seen_at = Utc::now();
                let next = s.derived();
                s.transition(next)
            })
            .flatten();
        self.publish(user_id, change);
    }

    fn publish(&self, user_id: &str, change: Option<(PresenceState, PresenceState)>) {
        let Some((previous, current)) = change else {
            return;
        };
        match (previous.is_present(), current.is_present()) {
            (false, true) => metrics::adjust_gauge(&metrics::USERS_ONLINE, 1),
            (true, false) => metrics::adjust_gauge(&metrics::USERS_ONLINE, -1),
            _ => {}
        }
        debug!(user_id = %user_id, ?previous, ?current, "presence changed");
        // No subscribers is fine.
        let _ = self.events.send(PresenceEvent {
            user_id: user_id.to_string(),
            previous,
            current,
            at: Utc::now(),
        });
    }
}

impl ConnectionObserver for PresenceManager {
    fn on_connection_added(&self, conn: &Arc<Connection>) {
        self.add(conn.user_id(), conn.id(), || !conn.is_closed());
    }

    fn on_connection_removed(&self, conn: &Arc<Connection>) {
        self.remove_connection(conn.user_id(), conn.id());
    }
}
