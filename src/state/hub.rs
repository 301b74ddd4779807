//! The Hub - one instance of every session component, wired together.
//!
//! Everything a connection task or the HTTP side-car needs is reachable from
//! an `Arc<Hub>`. Several hubs can live in one process; nothing is global
//! except the Prometheus registry.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use pulse_proto::{CloseCode, Fingerprint, ServerFrame};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::breaker::BreakerRegistry;
use super::connection::Connection;
use super::heartbeat::HeartbeatMonitor;
use super::presence::PresenceManager;
use super::queue::DeliveryQueue;
use super::reconnect::{ReconnectPolicy, ReconnectTracker};
use super::registry::{ConnectionRegistry, Registration};
use super::tabs::{TabCoordinator, TabEvent};
use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::Config;
use crate::error::{ActionError, PolicyError, RegistryError};
use crate::store::{MemoryStore, SharedStore};
use crate::telemetry::{Telemetry, TelemetrySnapshot};

/// A client action after decoding, ready for dedup and dispatch.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub user_id: String,
    pub tab_id: String,
    pub kind: String,
    pub action: String,
    pub target: String,
    pub at_ms: i64,
    pub leader_only: bool,
    pub payload: Value,
}

/// Business logic hook for client actions that passed dedup.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: &ActionRequest) -> Result<(), String>;
}

/// Default handler: accepts and logs.
pub struct LoggingActionHandler;

#[async_trait]
impl ActionHandler for LoggingActionHandler {
    async fn handle(&self, request: &ActionRequest) -> Result<(), String> {
        info!(
            user_id = %request.user_id,
            tab_id = %request.tab_id,
            kind = %request.kind,
            action = %request.action,
            target = %request.target,
            "client action"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Accepted(Fingerprint),
    Duplicate(Fingerprint),
}

/// Served by `GET /stats`.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub users: usize,
    pub users_online: usize,
    pub open_breakers: usize,
    pub store_backend: &'static str,
    pub telemetry: TelemetrySnapshot,
}

/// What one maintenance sweep dropped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub store_keys: usize,
    pub queues: usize,
    pub sessions: usize,
    pub reconnects: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.store_keys + self.queues + self.sessions + self.reconnects
    }
}

pub struct Hub {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceManager>,
    pub tabs: Arc<TabCoordinator>,
    pub queue: Arc<DeliveryQueue>,
    pub policy: ReconnectPolicy,
    pub reconnects: ReconnectTracker,
    pub breakers: Arc<BreakerRegistry>,
    pub heartbeat: HeartbeatMonitor,
    pub telemetry: Arc<Telemetry>,
    pub store: Arc<dyn SharedStore>,
    pub auth: Arc<dyn Authenticator>,
    actions: RwLock<Arc<dyn ActionHandler>>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(
        config: Config,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn SharedStore>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Arc<Self>, PolicyError> {
        let policy = ReconnectPolicy::from_config(&config.reconnect)?;

        let registry = Arc::new(ConnectionRegistry::new(
            config.limits.max_connections_per_user,
            telemetry.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            telemetry.clone(),
        ));
        let presence = PresenceManager::new(config.session.offline_debounce());
        let tabs = TabCoordinator::new(
            store.clone(),
            config.store.key_prefix.clone(),
            config.tabs.dedup_window(),
            config.tabs.state_ttl(),
            telemetry.clone(),
        );
        let queue = DeliveryQueue::new(
            registry.clone(),
            breakers.clone(),
            policy,
            config.limits.queue_capacity_per_user,
            config.limits.replay_window,
            telemetry.clone(),
        );

        // Tabs first so leadership settles before presence sees the removal.
        registry.add_observer(queue.clone());
        registry.add_observer(tabs.clone());
        registry.add_observer(presence.clone());

        let hub = Arc::new(Self {
            heartbeat: HeartbeatMonitor::new(&config.heartbeat),
            reconnects: ReconnectTracker::new(policy),
            config: Arc::new(config),
            registry,
            presence,
            tabs,
            queue,
            policy,
            breakers,
            telemetry,
            store,
            auth,
            actions: RwLock::new(Arc::new(LoggingActionHandler)),
            shutdown: CancellationToken::new(),
        });

        if tokio::runtime::Handle::try_current().is_ok() {
            hub.spawn_tab_notifier();
            hub.spawn_sweeper();
        }
        Ok(hub)
    }

    /// Hub backed by a process-local store and the static token table.
    pub fn in_memory(config: Config) -> Result<Arc<Self>, PolicyError> {
        let auth = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));
        Self::new(
            config,
            auth,
            Arc::new(MemoryStore::new()),
            Arc::new(Telemetry::new()),
        )
    }

    pub fn set_action_handler(&self, handler: Arc<dyn ActionHandler>) {
        *self.actions.write() = handler;
    }

    /// Cancelled when the server shuts down. Connection tokens are children.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Register an admitted connection and start draining its user's queue.
    pub fn attach(self: &Arc<Self>, conn: Arc<Connection>) -> Result<Registration, RegistryError> {
        let registration = self.registry.register(conn.clone())?;
        self.spawn_flush(conn.user_id());
        Ok(registration)
    }

    /// Unregister a connection. Idempotent.
    pub fn detach(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.registry.unregister(connection_id)
    }

    /// Queue `payload` for `user_id` and flush in the background.
    pub fn publish(self: &Arc<Self>, user_id: &str, payload: Bytes) -> u64 {
        let id = self.queue.enqueue(user_id, payload);
        self.spawn_flush(user_id);
        id
    }

    fn spawn_flush(self: &Arc<Self>, user_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hub = Arc::downgrade(self);
        let user_id = user_id.to_string();
        handle.spawn(async move {
            if let Some(hub) = hub.upgrade() {
                hub.queue.flush(&user_id).await;
            }
        });
    }

    /// Advisory frame sent before the server closes a connection with `code`.
    ///
    /// Retryable closes count against the user's reconnect budget.
    pub fn reconnect_advice(&self, user_id: &str, code: CloseCode) -> ServerFrame {
        if !code.is_retryable() {
            return ServerFrame::Reconnect {
                attempt: 0,
                delay_ms: 0,
                give_up: true,
            };
        }
        let attempt = self.reconnects.record_disconnect(user_id);
        ServerFrame::Reconnect {
            attempt: attempt.attempt_number,
            delay_ms: attempt.next_delay_ms,
            give_up: attempt.give_up,
        }
    }

    /// A connection of `user_id` completed a heartbeat round trip.
    pub fn connection_healthy(&self, user_id: &str) {
        self.reconnects.reset(user_id);
    }

    /// End a user's session: drop queued messages and close every connection.
    pub fn close_user(&self, user_id: &str) -> usize {
        let dropped = self.queue.cancel_user(user_id);
        let conns = self.registry.list_by_user(user_id);
        for conn in &conns {
            conn.shutdown(CloseCode::SESSION_CLOSED);
            self.registry.unregister(conn.id().as_str());
        }
        info!(user_id = %user_id, connections = conns.len(), dropped, "session closed");
        conns.len()
    }

    /// Leader check, dedup, then business logic.
    pub async fn handle_action(&self, request: ActionRequest) -> Result<ActionOutcome, ActionError> {
        if request.leader_only {
            self.tabs.ensure_leader(&request.user_id, &request.tab_id)?;
        }

        let fingerprint = Fingerprint::compute(
            &request.kind,
            &request.action,
            &request.target,
            request.at_ms,
            self.config.tabs.dedup_window_ms,
        );
        if self.tabs.is_duplicate(&request.user_id, &fingerprint).await {
            return Ok(ActionOutcome::Duplicate(fingerprint));
        }

        let handler = self.actions.read().clone();
        handler
            .handle(&request)
            .await
            .map_err(ActionError::Rejected)?;
        Ok(ActionOutcome::Accepted(fingerprint))
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            users: self.registry.user_count(),
            users_online: self.presence.online_count(),
            open_breakers: self.breakers.open_count(),
            store_backend: self.store.backend_name(),
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// Drop expired store keys and per-user state nobody has touched for
    /// `session.idle_retention_ms`.
    pub fn sweep(&self) -> SweepReport {
        let retention = self.config.session.idle_retention();
        SweepReport {
            store_keys: self.store.purge_expired(),
            queues: self.queue.prune_idle(retention),
            sessions: self.presence.prune_offline(retention),
            reconnects: self.reconnects.prune(retention),
        }
    }

    /// Run [`Hub::sweep`] every `session.sweep_interval_ms` until shutdown.
    fn spawn_sweeper(self: &Arc<Self>) {
        let hub = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.session.sweep_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let report = hub.sweep();
                if report.total() > 0 {
                    debug!(?report, "maintenance sweep");
                }
            }
        });
    }

    /// Forward tab events to the affected connections.
    fn spawn_tab_notifier(self: &Arc<Self>) {
        let mut events = self.tabs.subscribe();
        let hub = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "tab notifier lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.deliver_tab_event(event).await;
            }
        });
    }

    async fn deliver_tab_event(&self, event: TabEvent) {
        match event {
            TabEvent::LeadershipChanged {
                user_id,
                leader_tab_id,
                leader_connection_id,
            } => {
                self.presence
                    .set_leader(&user_id, leader_connection_id.as_ref());
                let Some(leader_tab_id) = leader_tab_id else {
                    return;
                };
                let frame = Bytes::from(ServerFrame::LeadershipChanged { leader_tab_id }.to_text());
                for conn in self.registry.list_open_by_user(&user_id) {
                    let _ = conn.send(frame.clone()).await;
                }
            }
            TabEvent::StateMerged {
                user_id,
                source_tab_id,
                version,
                conflict_count,
                state,
            } => {
                let source_conn = self
                    .tabs
                    .tabs(&user_id)
                    .into_iter()
                    .find(|t| t.tab_id == source_tab_id)
                    .map(|t| t.connection_id);
                let frame = Bytes::from(
                    ServerFrame::StateSync {
                        version,
                        source_tab_id,
                        conflict_count,
                        state,
                    }
                    .to_text(),
                );
                for conn in self.registry.list_open_by_user(&user_id) {
                    if source_conn.as_ref() == Some(conn.id()) {
                        continue;
                    }
                    let _ = conn.send(frame.clone()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::presence::PresenceState;
    use crate::transport::MemoryTransport;

    fn hub() -> Arc<Hub> {
        let mut config = Config::default();
        config.session.offline_debounce_ms = 0;
        Hub::in_memory(config).unwrap()
    }

    fn attach(hub: &Arc<Hub>, user: &str) -> (Arc<Connection>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let conn = Arc::new(Connection::new(user, transport.clone()));
        hub.attach(conn.clone()).unwrap();
        (conn, transport)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn action(tab: &str, leader_only: bool) -> ActionRequest {
        ActionRequest {
            user_id: "u".into(),
            tab_id: tab.into(),
            kind: "tool".into(),
            action: "approve".into(),
            target: "req-1".into(),
            at_ms: 1_000,
            leader_only,
            payload: Value::Null,
        }
    }

    #[test]
    fn rejects_invalid_policy() {
        let mut config = Config::default();
        config.reconnect.jitter_factor = 2.0;
        assert!(matches!(
            Hub::in_memory(config),
            Err(PolicyError::InvalidJitter(_))
        ));
    }

    #[tokio::test]
    async fn publish_reaches_attached_connection() {
        let hub = hub();
        let (_conn, transport) = attach(&hub, "u");
        assert_eq!(hub.publish("u", Bytes::from_static(br#"{"kind":"started"}"#)), 1);
        settle().await;
        assert_eq!(transport.sent_text(), vec![
            r#"{"type":"event","seq":1,"payload":{"kind":"started"}}"#.to_string()
        ]);
    }

    #[tokio::test]
    async fn duplicate_action_handled_once() {
        struct Counting(parking_lot::Mutex<u32>);

        #[async_trait]
        impl ActionHandler for Counting {
            async fn handle(&self, _request: &ActionRequest) -> Result<(), String> {
                *self.0.lock() += 1;
                Ok(())
            }
        }

        let hub = hub();
        let counter = Arc::new(Counting(parking_lot::Mutex::new(0)));
        hub.set_action_handler(counter.clone());

        let first = hub.handle_action(action("T1", false)).await.unwrap();
        let second = hub.handle_action(action("T2", false)).await.unwrap();
        assert!(matches!(first, ActionOutcome::Accepted(_)));
        assert!(matches!(second, ActionOutcome::Duplicate(_)));
        assert_eq!(*counter.0.lock(), 1);
    }

    #[tokio::test]
    async fn leader_only_action_from_follower() {
        let hub = hub();
        let (c1, _) = attach(&hub, "u");
        let (c2, _) = attach(&hub, "u");
        hub.tabs.register_tab("u", "T1", c1.id()).await.unwrap();
        hub.tabs.register_tab("u", "T2", c2.id()).await.unwrap();

        assert_eq!(
            hub.handle_action(action("T2", true)).await,
            Err(ActionError::Tab(crate::error::TabError::NotLeader("T2".into())))
        );
        assert!(hub.handle_action(action("T1", true)).await.is_ok());
    }

    #[tokio::test]
    async fn leadership_reaches_presence_and_tabs() {
        let hub = hub();
        let (c1, _t1) = attach(&hub, "u");
        let (c2, t2) = attach(&hub, "u");
        hub.tabs.register_tab("u", "T1", c1.id()).await.unwrap();
        hub.tabs.register_tab("u", "T2", c2.id()).await.unwrap();
        settle().await;
        assert_eq!(
            hub.presence.session("u").unwrap().leader_connection_id.as_ref(),
            Some(c1.id())
        );

        hub.detach(c1.id().as_str());
        settle().await;

        assert_eq!(hub.tabs.leader("u").unwrap().tab_id, "T2");
        assert_eq!(
            hub.presence.session("u").unwrap().leader_connection_id.as_ref(),
            Some(c2.id())
        );
        assert!(
            t2.sent_text()
                .iter()
                .any(|f| f == r#"{"type":"leadership_changed","leader_tab_id":"T2"}"#)
        );
    }

    #[tokio::test]
    async fn close_user_cancels_and_disconnects() {
        let hub = hub();
        let (conn, _) = attach(&hub, "u");
        conn.set_state(crate::state::connection::ConnectionState::Draining);
        hub.publish("u", Bytes::from_static(b"1"));

        assert_eq!(hub.close_user("u"), 1);
        assert_eq!(conn.pending_close(), Some(CloseCode::SESSION_CLOSED));
        assert!(hub.registry.is_empty());
        assert_eq!(hub.queue.pending_len("u"), 0);
        assert_eq!(hub.presence.get_presence("u"), PresenceState::Offline);
    }

    #[test]
    fn reconnect_advice_counts_and_resets() {
        let hub = hub();
        let first = hub.reconnect_advice("u", CloseCode::HEARTBEAT_TIMEOUT);
        assert!(matches!(first, ServerFrame::Reconnect { attempt: 1, give_up: false, .. }));
        let second = hub.reconnect_advice("u", CloseCode::GOING_AWAY);
        assert!(matches!(second, ServerFrame::Reconnect { attempt: 2, .. }));

        hub.connection_healthy("u");
        let fresh = hub.reconnect_advice("u", CloseCode::GOING_AWAY);
        assert!(matches!(fresh, ServerFrame::Reconnect { attempt: 1, .. }));

        let terminal = hub.reconnect_advice("u", CloseCode::AUTH_FAILED);
        assert!(matches!(terminal, ServerFrame::Reconnect { give_up: true, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_state() {
        let hub = hub();
        let (_c, _) = attach(&hub, "u");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let stats = hub.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.users_online, 1);
        assert_eq!(stats.store_backend, "memory");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_dedup_keys() {
        let store = Arc::new(MemoryStore::new());
        let hub = Hub::new(
            Config::default(),
            Arc::new(StaticTokenAuthenticator::default()),
            store.clone(),
            Arc::new(Telemetry::new()),
        )
        .unwrap();

        for i in 0..10_000 {
            let fp = Fingerprint::compute("tool", "approve", &format!("req-{i}"), 1_000, 5_000);
            assert!(!hub.tabs.is_duplicate("u", &fp).await);
        }
        assert_eq!(store.len(), 10_000);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_forgets_departed_users() {
        let mut config = Config::default();
        config.session.offline_debounce_ms = 0;
        // Keep the background sweeper out of the way.
        config.session.sweep_interval_ms = 86_400_000;
        let hub = Hub::in_memory(config).unwrap();
        let (conn, _transport) = attach(&hub, "u");
        hub.publish("u", Bytes::from_static(b"{}"));
        settle().await;
        hub.reconnects.record_disconnect("u");
        hub.detach(conn.id().as_str());

        assert_eq!(hub.sweep(), SweepReport::default());

        tokio::time::advance(hub.config.session.idle_retention()).await;
        let report = hub.sweep();
        assert_eq!(report.queues, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.reconnects, 1);
        assert!(hub.presence.session("u").is_none());
        assert_eq!(hub.queue.user_count(), 0);
        assert_eq!(hub.reconnects.current("u"), 0);
    }
}
