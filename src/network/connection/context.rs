use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

use crate::state::{Connection, HeartbeatState, Hub, IdleChange};

/// Per-connection state shared by the event loop and frame dispatch.
///
/// Owned by the connection task; nothing here is shared with other tasks
/// except through `hub` and `conn`.
pub(super) struct ConnectionContext {
    pub hub: Arc<Hub>,
    pub conn: Arc<Connection>,
    pub addr: SocketAddr,
    pub heartbeat: HeartbeatState,
    /// Consecutive frames that failed to decode.
    pub malformed: u8,
    /// Whether the reconnect budget was already reset for this connection.
    pub reported_healthy: bool,
}

impl ConnectionContext {
    pub fn new(hub: Arc<Hub>, conn: Arc<Connection>, addr: SocketAddr) -> Self {
        let heartbeat = hub.heartbeat.start(Instant::now());
        Self {
            hub,
            conn,
            addr,
            heartbeat,
            malformed: 0,
            reported_healthy: false,
        }
    }

    pub fn user_id(&self) -> &str {
        self.conn.user_id()
    }

    /// Forward an idle transition to presence.
    pub fn apply_idle(&self, change: Option<IdleChange>) {
        match change {
            Some(IdleChange::BecameIdle) => {
                self.hub.presence.mark_idle(self.conn.user_id(), self.conn.id());
            }
            Some(IdleChange::BecameActive) => {
                self.hub.presence.mark_active(self.conn.user_id(), self.conn.id());
            }
            None => {}
        }
    }
}
