//! Multi-Tab Coordinator.
//!
//! A user with several browser tabs open gets one leader tab (the oldest by
//! registration time) that performs singleton actions. Leadership moves to
//! the next-oldest tab when the leader leaves, either explicitly or because
//! its connection went away.
//!
//! The coordinator also suppresses duplicate client actions by fingerprint
//! and merges the per-user shared state that tabs sync with each other.
//! Merges are last-writer-wins per key on an embedded numeric `timestamp`.
//!
//! Registrations and state snapshots are mirrored to the [`SharedStore`]
//! (`{prefix}:tabs:{user}` hash, `{prefix}:tabstate:{user}` string).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_proto::Fingerprint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId};
use super::registry::ConnectionObserver;
use crate::error::TabError;
use crate::store::SharedStore;
use crate::telemetry::{Event, Telemetry};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabRegistration {
    pub tab_id: String,
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub registered_at: DateTime<Utc>,
    pub is_leader: bool,
    pub last_synced_state_version: u64,
    /// Tie-breaker for identical `registered_at`.
    #[serde(skip)]
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabRegistered {
    pub is_leader: bool,
    pub total_tabs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabUnregistered {
    pub was_leader: bool,
    pub remaining_tabs: usize,
    pub new_leader: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TabEvent {
    LeadershipChanged {
        user_id: String,
        leader_tab_id: Option<String>,
        leader_connection_id: Option<ConnectionId>,
    },
    StateMerged {
        user_id: String,
        source_tab_id: String,
        version: u64,
        conflict_count: u64,
        state: Map<String, Value>,
    },
}

/// Point-in-time copy of a user's shared state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedStateSnapshot {
    pub version: u64,
    pub conflict_count: u64,
    pub state: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StateEntry {
    value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    source_tab: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SharedState {
    version: u64,
    conflict_count: u64,
    entries: BTreeMap<String, StateEntry>,
}

impl SharedState {
    fn snapshot(&self) -> SharedStateSnapshot {
        SharedStateSnapshot {
            version: self.version,
            conflict_count: self.conflict_count,
            state: self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
        }
    }

    /// Apply `updates` and return `(changed, conflicts)`.
    fn merge(&mut self, source_tab: &str, updates: Map<String, Value>) -> (bool, u64) {
        let mut changed = false;
        let mut conflicts = 0;

        for (key, value) in updates {
            let timestamp = embedded_timestamp(&value);
            let accept = match self.entries.get(&key) {
                None => true,
                Some(current) if current.value == value => false,
                Some(current) => match (timestamp, current.timestamp) {
                    (Some(incoming), Some(existing)) if incoming > existing => true,
                    (Some(incoming), Some(existing)) if incoming < existing => false,
                    // Equal or missing timestamps with differing values.
                    _ => {
                        conflicts += 1;
                        true
                    }
                },
            };
            if accept {
                self.entries.insert(
                    key,
                    StateEntry {
                        value,
                        timestamp,
                        source_tab: source_tab.to_string(),
                    },
                );
                changed = true;
            }
        }

        if changed {
            self.version += 1;
        }
        self.conflict_count += conflicts;
        (changed, conflicts)
    }
}

fn embedded_timestamp(value: &Value) -> Option<f64> {
    value.get("timestamp").and_then(Value::as_f64)
}

#[derive(Debug, Default)]
struct UserTabs {
    tabs: Vec<TabRegistration>,
    state: SharedState,
    seeded: bool,
}

impl UserTabs {
    fn leader(&self) -> Option<&TabRegistration> {
        self.tabs.iter().find(|t| t.is_leader)
    }

    fn leader_key(&self) -> Option<(String, ConnectionId)> {
        self.leader()
            .map(|t| (t.tab_id.clone(), t.connection_id.clone()))
    }

    /// Re-elect: the oldest tab leads. Exactly one leader when non-empty.
    fn elect(&mut self) {
        let oldest = self
            .tabs
            .iter()
            .min_by(|a, b| (a.registered_at, a.seq).cmp(&(b.registered_at, b.seq)))
            .map(|t| t.seq);
        for tab in &mut self.tabs {
            tab.is_leader = Some(tab.seq) == oldest;
        }
    }
}

pub struct TabCoordinator {
    users: DashMap<String, UserTabs>,
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    dedup_window: Duration,
    state_ttl: Duration,
    events: broadcast::Sender<TabEvent>,
    seq: AtomicU64,
    telemetry: Arc<Telemetry>,
    me: Weak<TabCoordinator>,
}

impl TabCoordinator {
    pub fn new(
        store: Arc<dyn SharedStore>,
        key_prefix: impl Into<String>,
        dedup_window: Duration,
        state_ttl: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            users: DashMap::new(),
            store,
            key_prefix: key_prefix.into(),
            dedup_window,
            state_ttl,
            events,
            seq: AtomicU64::new(0),
            telemetry,
            me: me.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    fn tabs_key(&self, user_id: &str) -> String {
        format!("{}:tabs:{}", self.key_prefix, user_id)
    }

    fn state_key(&self, user_id: &str) -> String {
        format!("{}:tabstate:{}", self.key_prefix, user_id)
    }

    fn dedup_key(&self, user_id: &str, fingerprint: &Fingerprint) -> String {
        format!("{}:dedup:{}:{}", self.key_prefix, user_id, fingerprint.as_str())
    }

    fn emit(&self, event: TabEvent) {
        let _ = self.events.send(event);
    }

    fn leadership_event(
        &self,
        user_id: &str,
        before: Option<(String, ConnectionId)>,
        after: Option<(String, ConnectionId)>,
    ) {
        if before == after {
            return;
        }
        let (leader_tab_id, leader_connection_id) = after.unzip();
        info!(user_id = %user_id, leader = ?leader_tab_id, "tab leadership changed");
        self.emit(TabEvent::LeadershipChanged {
            user_id: user_id.to_string(),
            leader_tab_id,
            leader_connection_id,
        });
    }

    /// Load the persisted shared state the first time a user is touched.
    async fn ensure_seeded(&self, user_id: &str) {
        if self.users.get(user_id).is_some_and(|u| u.seeded) {
            return;
        }
        let loaded = match self.store.get(&self.state_key(user_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<SharedState>(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    debug!(user_id = %user_id, error = %e, "ignoring unreadable tab state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "tab state not loaded");
                None
            }
        };

        let mut user = self.users.entry(user_id.to_string()).or_default();
        if !user.seeded {
            if let Some(state) = loaded
                && state.version > user.state.version
            {
                user.state = state;
            }
            user.seeded = true;
        }
    }

    /// Register `tab_id` for `user_id` on `connection_id`.
    ///
    /// Re-registering a known tab rebinds it to the new connection and keeps
    /// its seniority.
    pub async fn register_tab(
        &self,
        user_id: &str,
        tab_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<TabRegistered, TabError> {
        self.register(user_id, tab_id, connection_id, || true).await
    }

    /// Register `tab_id` on a live connection.
    ///
    /// Fails with [`TabError::ConnectionGone`] if the registry dropped `conn`
    /// before the tab could be recorded, so a dead connection never ends up
    /// holding a tab.
    pub async fn register_tab_on(
        &self,
        tab_id: &str,
        conn: &Connection,
    ) -> Result<TabRegistered, TabError> {
        self.register(conn.user_id(), tab_id, conn.id(), || !conn.is_closed())
            .await
    }

    async fn register(
        &self,
        user_id: &str,
        tab_id: &str,
        connection_id: &ConnectionId,
        alive: impl Fn() -> bool,
    ) -> Result<TabRegistered, TabError> {
        if user_id.trim().is_empty() || tab_id.trim().is_empty() {
            return Err(TabError::InvalidTab);
        }
        self.ensure_seeded(user_id).await;

        let (registered, before, after, record) = {
            let mut user = self.users.entry(user_id.to_string()).or_default();
            // Removal marks the connection closed before it takes this entry
            // to drop its tabs, so checking under the entry lock cannot miss it.
            if !alive() {
                drop(user);
                self.users.remove_if(user_id, |_, u| u.tabs.is_empty());
                debug!(user_id = %user_id, tab_id = %tab_id, connection_id = %connection_id, "tab not registered, connection gone");
                return Err(TabError::ConnectionGone(connection_id.to_string()));
            }
            let before = user.leader_key();
            let version = user.state.version;

            match user.tabs.iter_mut().find(|t| t.tab_id == tab_id) {
                Some(existing) => {
                    existing.connection_id = connection_id.clone();
                    existing.last_synced_state_version = version;
                }
                None => user.tabs.push(TabRegistration {
                    tab_id: tab_id.to_string(),
                    user_id: user_id.to_string(),
                    connection_id: connection_id.clone(),
                    registered_at: Utc::now(),
                    is_leader: false,
                    last_synced_state_version: version,
                    seq: self.seq.fetch_add(1, Ordering::Relaxed),
                }),
            }
            user.elect();

            let record = user.tabs.iter().find(|t| t.tab_id == tab_id).cloned();
            let registered = TabRegistered {
                is_leader: record.as_ref().is_some_and(|t| t.is_leader),
                total_tabs: user.tabs.len(),
            };
            (registered, before, user.leader_key(), record)
        };

        debug!(user_id = %user_id, tab_id = %tab_id, connection_id = %connection_id, is_leader = registered.is_leader, "tab registered");
        self.leadership_event(user_id, before, after);

        if let Some(record) = record {
            self.persist_tab(user_id, &record).await;
        }
        Ok(registered)
    }

    async fn persist_tab(&self, user_id: &str, record: &TabRegistration) {
        let key = self.tabs_key(user_id);
        let Ok(value) = serde_json::to_string(record) else {
            return;
        };
        if let Err(e) = self.store.hset(&key, &record.tab_id, &value).await {
            debug!(user_id = %user_id, error = %e, "tab registration not persisted");
            return;
        }
        let _ = self.store.expire(&key, self.state_ttl).await;
    }

    /// Remove a tab and re-elect if it was the leader.
    pub async fn unregister_tab(
        &self,
        user_id: &str,
        tab_id: &str,
    ) -> Result<TabUnregistered, TabError> {
        let (outcome, before, after) = {
            let mut user = self
                .users
                .get_mut(user_id)
                .ok_or_else(|| TabError::UnknownTab(tab_id.to_string()))?;
            let pos = user
                .tabs
                .iter()
                .position(|t| t.tab_id == tab_id)
                .ok_or_else(|| TabError::UnknownTab(tab_id.to_string()))?;

            let before = user.leader_key();
            let removed = user.tabs.remove(pos);
            user.elect();
            let after = user.leader_key();
            let outcome = TabUnregistered {
                was_leader: removed.is_leader,
                remaining_tabs: user.tabs.len(),
                new_leader: if removed.is_leader {
                    after.as_ref().map(|(tab, _)| tab.clone())
                } else {
                    None
                },
            };
            (outcome, before, after)
        };
        self.users.remove_if(user_id, |_, u| u.tabs.is_empty());

        debug!(user_id = %user_id, tab_id = %tab_id, remaining = outcome.remaining_tabs, "tab unregistered");
        self.leadership_event(user_id, before, after);

        if let Err(e) = self.store.hdel(&self.tabs_key(user_id), tab_id).await {
            debug!(user_id = %user_id, error = %e, "tab removal not persisted");
        }
        Ok(outcome)
    }

    /// Drop every tab hosted on `connection_id`.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &ConnectionId) -> Vec<String> {
        let (removed, before, after) = {
            let Some(mut user) = self.users.get_mut(user_id) else {
                return Vec::new();
            };
            let before = user.leader_key();
            let mut removed = Vec::new();
            user.tabs.retain(|t| {
                if &t.connection_id == connection_id {
                    removed.push(t.tab_id.clone());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                return removed;
            }
            user.elect();
            (removed, before, user.leader_key())
        };
        self.users.remove_if(user_id, |_, u| u.tabs.is_empty());
        self.leadership_event(user_id, before, after);

        if let (Ok(handle), Some(me)) = (tokio::runtime::Handle::try_current(), self.me.upgrade()) {
            let user_id = user_id.to_string();
            let tabs = removed.clone();
            handle.spawn(async move {
                let key = me.tabs_key(&user_id);
                for tab in tabs {
                    if let Err(e) = me.store.hdel(&key, &tab).await {
                        debug!(user_id = %user_id, error = %e, "tab removal not persisted");
                        break;
                    }
                }
            });
        }
        removed
    }

    /// `true` if the same action was already seen within the dedup window.
    ///
    /// Store errors answer `false`: a duplicate slipping through is preferred
    /// over dropping a distinct action.
    pub async fn is_duplicate(&self, user_id: &str, fingerprint: &Fingerprint) -> bool {
        let key = self.dedup_key(user_id, fingerprint);
        match self.store.set_if_absent(&key, "1", self.dedup_window).await {
            Ok(true) => false,
            Ok(false) => {
                self.telemetry.record(Event::DuplicateSuppressed);
                debug!(user_id = %user_id, fingerprint = %fingerprint.as_str(), "duplicate action suppressed");
                true
            }
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "dedup check unavailable");
                false
            }
        }
    }

    /// Merge `updates` from `source_tab` into the user's shared state.
    ///
    /// Changes are broadcast to subscribers as [`TabEvent::StateMerged`] and
    /// persisted with the configured TTL.
    pub async fn merge_shared_state(
        &self,
        user_id: &str,
        source_tab: &str,
        updates: Map<String, Value>,
    ) -> Result<SharedStateSnapshot, TabError> {
        let (snapshot, changed, conflicts, persisted) = {
            let mut user = self
                .users
                .get_mut(user_id)
                .ok_or_else(|| TabError::UnknownTab(source_tab.to_string()))?;
            if !user.tabs.iter().any(|t| t.tab_id == source_tab) {
                return Err(TabError::UnknownTab(source_tab.to_string()));
            }

            let (changed, conflicts) = user.state.merge(source_tab, updates);
            let version = user.state.version;
            if let Some(tab) = user.tabs.iter_mut().find(|t| t.tab_id == source_tab) {
                tab.last_synced_state_version = version;
            }
            let persisted = changed
                .then(|| serde_json::to_string(&user.state).ok())
                .flatten();
            (user.state.snapshot(), changed, conflicts, persisted)
        };

        for _ in 0..conflicts {
            self.telemetry.record(Event::StateConflict);
        }
        if conflicts > 0 {
            debug!(user_id = %user_id, source_tab = %source_tab, conflicts, "shared state conflicts resolved");
        }

        if changed {
            self.emit(TabEvent::StateMerged {
                user_id: user_id.to_string(),
                source_tab_id: source_tab.to_string(),
                version: snapshot.version,
                conflict_count: snapshot.conflict_count,
                state: snapshot.state.clone(),
            });
        }
        if let Some(raw) = persisted
            && let Err(e) = self
                .store
                .set(&self.state_key(user_id), &raw, Some(self.state_ttl))
                .await
        {
            debug!(user_id = %user_id, error = %e, "tab state not persisted");
        }
        Ok(snapshot)
    }

    /// Fail unless `tab_id` is the user's leader tab.
    pub fn ensure_leader(&self, user_id: &str, tab_id: &str) -> Result<(), TabError> {
        let user = self
            .users
            .get(user_id)
            .ok_or_else(|| TabError::UnknownTab(tab_id.to_string()))?;
        let tab = user
            .tabs
            .iter()
            .find(|t| t.tab_id == tab_id)
            .ok_or_else(|| TabError::UnknownTab(tab_id.to_string()))?;
        if tab.is_leader {
            Ok(())
        } else {
            Err(TabError::NotLeader(tab_id.to_string()))
        }
    }

    pub fn leader(&self, user_id: &str) -> Option<TabRegistration> {
        self.users.get(user_id).and_then(|u| u.leader().cloned())
    }

    /// Registered tabs of a user, oldest first.
    pub fn tabs(&self, user_id: &str) -> Vec<TabRegistration> {
        let mut tabs = self
            .users
            .get(user_id)
            .map(|u| u.tabs.clone())
            .unwrap_or_default();
        tabs.sort_by(|a, b| (a.registered_at, a.seq).cmp(&(b.registered_at, b.seq)));
        tabs
    }

    pub fn shared_state(&self, user_id: &str) -> Option<SharedStateSnapshot> {
        self.users.get(user_id).map(|u| u.state.snapshot())
    }
}

impl ConnectionObserver for TabCoordinator {
    fn on_connection_added(&self, _conn: &Arc<Connection>) {}

    fn on_connection_removed(&self, conn: &Arc<Connection>) {
        self.unregister_connection(conn.user_id(), conn.id());
    }
}
