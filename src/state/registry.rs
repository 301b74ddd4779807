//! Connection Registry - canonical set of live connections.
//!
//! Connections are indexed twice: by connection ID (the source of truth for
//! `find`) and by user ID (registration order, oldest first). Both indices
//! are sharded `DashMap`s so no global lock serializes registrations.
//!
//! Observers are notified after the maps are updated and all shard guards
//! have been dropped, so an observer may call back into the registry.

use dashmap::DashMap;
use parking_lot::RwLock;
use pulse_proto::CloseCode;
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId, ConnectionState};
use super::dashmap_ext::DashMapExt;
use crate::error::RegistryError;
use crate::metrics;
use crate::telemetry::{Event, Telemetry};

/// Receives connection lifecycle events.
///
/// Called synchronously from `register`/`unregister`; implementations must
/// not block. Spawn a task for anything that needs I/O.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_added(&self, conn: &Arc<Connection>);

    fn on_connection_removed(&self, conn: &Arc<Connection>);
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    /// Older connections of the same user removed to respect the per-user cap.
    /// Already asked to close with [`CloseCode::REPLACED`].
    pub evicted: Vec<Arc<Connection>>,
}

pub struct ConnectionRegistry {
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<String, Vec<ConnectionId>>,
    max_per_user: usize,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    telemetry: Arc<Telemetry>,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize, telemetry: Arc<Telemetry>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            max_per_user: max_per_user.max(1),
            observers: RwLock::new(Vec::new()),
            telemetry,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.write().push(observer);
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers.read().clone()
    }

    /// Register a connection. Never blocks on I/O.
    ///
    /// When the user already holds the maximum number of connections the
    /// oldest ones are evicted to make room.
    pub fn register(&self, conn: Arc<Connection>) -> Result<Registration, RegistryError> {
        let user_id = conn.user_id().trim();
        if user_id.is_empty() || user_id != conn.user_id() {
            return Err(RegistryError::InvalidUser);
        }

        let id = conn.id().clone();
        match self.by_id.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegistryError::Duplicate(id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                conn.set_state(ConnectionState::Open);
                v.insert(conn.clone());
            }
        }

        let overflow: Vec<ConnectionId> = {
            let mut ids = self.by_user.entry(conn.user_id().to_string()).or_default();
            ids.push(id.clone());
            let excess = ids.len().saturating_sub(self.max_per_user);
            ids.drain(..excess).collect()
        };

        metrics::adjust_gauge(&metrics::CONNECTIONS_OPEN, 1);
        self.telemetry.record(Event::ConnectionOpened);
        debug!(connection_id = %id, user_id = %conn.user_id(), "connection registered");

        for observer in self.observers() {
            observer.on_connection_added(&conn);
        }

        let mut evicted = Vec::with_capacity(overflow.len());
        for old in overflow {
            if let Some(old_conn) = self.by_id.get_cloned(&old) {
                // Record the code before the removal cancels the task.
                old_conn.shutdown(CloseCode::REPLACED);
            }
            if let Some(old_conn) = self.remove(&old) {
                self.telemetry.record(Event::ConnectionEvicted);
                info!(
                    connection_id = %old,
                    user_id = %old_conn.user_id(),
                    limit = self.max_per_user,
                    "evicted oldest connection"
                );
                evicted.push(old_conn);
            }
        }

        Ok(Registration { id, evicted })
    }

    /// Remove a connection. Unknown IDs are a no-op.
    pub fn unregister(&self, id: &str) -> Option<Arc<Connection>> {
        let conn = self.by_id.remove(id).map(|(_, c)| c)?;
        if let Some(mut ids) = self.by_user.get_mut(conn.user_id()) {
            ids.retain(|c| c.as_str() != id);
        }
        self.by_user.remove_if(conn.user_id(), |_, ids| ids.is_empty());
        self.finish_removal(&conn);
        Some(conn)
    }

    /// Remove an ID that was already dropped from the user index.
    fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.by_id.remove(id).map(|(_, c)| c)?;
        self.finish_removal(&conn);
        Some(conn)
    }

    fn finish_removal(&self, conn: &Arc<Connection>) {
        conn.set_state(ConnectionState::Closed);
        conn.cancel_token().cancel();
        metrics::adjust_gauge(&metrics::CONNECTIONS_OPEN, -1);
        self.telemetry.record(Event::ConnectionClosed);
        debug!(connection_id = %conn.id(), user_id = %conn.user_id(), "connection unregistered");

        for observer in self.observers() {
            observer.on_connection_removed(conn);
        }
    }

    pub fn find(&self, id: &str) -> Option<Arc<Connection>> {
        self.by_id.get_cloned(id)
    }

    /// All registered connections of a user, oldest first.
    pub fn list_by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let ids = self.by_user.get_cloned(user_id).unwrap_or_default();
        ids.iter().filter_map(|id| self.find(id.as_str())).collect()
    }

    /// Connections of a user that are eligible for delivery.
    pub fn list_open_by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.list_by_user(user_id)
            .into_iter()
            .filter(|c| c.is_open())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Every registered connection, in no particular order.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.by_id.iter_cloned().into_iter().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;

    fn conn(user: &str) -> Arc<Connection> {
        Arc::new(Connection::new(user, Arc::new(MemoryTransport::new())))
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connection_added(&self, conn: &Arc<Connection>) {
            self.events.lock().push(format!("+{}", conn.id()));
        }
        fn on_connection_removed(&self, conn: &Arc<Connection>) {
            self.events.lock().push(format!("-{}", conn.id()));
        }
    }

    fn registry(max: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(max, Arc::new(Telemetry::new()))
    }

    #[test]
    fn rejects_empty_user() {
        let reg = registry(4);
        assert_eq!(
            reg.register(conn("")).unwrap_err(),
            RegistryError::InvalidUser
        );
        assert_eq!(
            reg.register(conn("  ")).unwrap_err(),
            RegistryError::InvalidUser
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn register_find_list() {
        let reg = registry(4);
        let a = conn("alice");
        let b = conn("alice");
        let c = conn("bob");
        reg.register(a.clone()).unwrap();
        reg.register(b.clone()).unwrap();
        reg.register(c.clone()).unwrap();

        assert!(a.is_open());
        assert_eq!(reg.find(a.id().as_str()).unwrap().id(), a.id());
        let ids: Vec<_> = reg.list_by_user("alice").iter().map(|c| c.id().clone()).collect();
        assert_eq!(ids, vec![a.id().clone(), b.id().clone()]);
        assert_eq!(reg.user_count(), 2);
        assert!(reg.list_by_user("carol").is_empty());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let reg = registry(4);
        let a = conn("alice");
        reg.register(a.clone()).unwrap();
        assert!(matches!(
            reg.register(a.clone()),
            Err(RegistryError::Duplicate(_))
        ));
        assert_eq!(reg.list_by_user("alice").len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = registry(4);
        let a = conn("alice");
        let b = conn("alice");
        reg.register(a.clone()).unwrap();
        reg.register(b.clone()).unwrap();

        assert!(reg.unregister(a.id().as_str()).is_some());
        let once: Vec<_> = reg.list_by_user("alice").iter().map(|c| c.id().clone()).collect();
        assert!(reg.unregister(a.id().as_str()).is_none());
        let twice: Vec<_> = reg.list_by_user("alice").iter().map(|c| c.id().clone()).collect();

        assert_eq!(once, twice);
        assert_eq!(reg.len(), 1);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(a.cancel_token().is_cancelled());
        assert!(reg.unregister("never-existed").is_none());
    }

    #[test]
    fn last_connection_removes_user_index() {
        let reg = registry(4);
        let a = conn("alice");
        reg.register(a.clone()).unwrap();
        reg.unregister(a.id().as_str());
        assert_eq!(reg.user_count(), 0);
    }

    #[test]
    fn evicts_oldest_over_cap() {
        let telemetry = Arc::new(Telemetry::new());
        let reg = ConnectionRegistry::new(2, telemetry.clone());
        let a = conn("alice");
        let b = conn("alice");
        let c = conn("alice");
        reg.register(a.clone()).unwrap();
        reg.register(b.clone()).unwrap();
        let registration = reg.register(c.clone()).unwrap();

        assert_eq!(registration.evicted.len(), 1);
        assert_eq!(registration.evicted[0].id(), a.id());
        assert_eq!(a.pending_close(), Some(CloseCode::REPLACED));
        assert!(reg.find(a.id().as_str()).is_none());
        assert_eq!(reg.list_by_user("alice").len(), 2);
        assert_eq!(telemetry.get(Event::ConnectionEvicted), 1);
    }

    #[test]
    fn observers_see_add_and_remove() {
        let reg = registry(1);
        let recorder = Arc::new(Recorder::default());
        reg.add_observer(recorder.clone());

        let a = conn("alice");
        let b = conn("alice");
        reg.register(a.clone()).unwrap();
        reg.register(b.clone()).unwrap();
        reg.unregister(b.id().as_str());

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                format!("+{}", a.id()),
                format!("+{}", b.id()),
                format!("-{}", a.id()),
                format!("-{}", b.id()),
            ]
        );
    }

    #[test]
    fn concurrent_register_unregister() {
        let reg = Arc::new(registry(1_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let c = conn(&format!("user-{}", t % 2));
                        reg.register(c.clone()).unwrap();
                        assert!(reg.find(c.id().as_str()).is_some());
                        reg.unregister(c.id().as_str());
                        assert!(reg.find(c.id().as_str()).is_none());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reg.is_empty());
        assert_eq!(reg.user_count(), 0);
    }
}
