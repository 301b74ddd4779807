//! A single live transport session.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pulse_proto::CloseCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{SendError, Transport};

/// Opaque, globally unique connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// Allocate a fresh identifier. IDs are never reused.
    pub fn generate() -> Self {
        Self(Arc::from(format!("c-{}", uuid::Uuid::new_v4().simple())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl std::borrow::Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for ConnectionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, not yet registered.
    Connecting,
    /// Registered and eligible for delivery.
    Open,
    /// Close requested; no new deliveries.
    Draining,
    /// Removed from the registry.
    Closed,
}

#[derive(Debug)]
struct Live {
    state: ConnectionState,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    latency_ms: Option<u64>,
    close_code: Option<CloseCode>,
}

/// One physical transport session belonging to exactly one user.
///
/// Shared as `Arc<Connection>`. Identity fields are immutable; the mutable
/// part is behind a short-lived mutex that is never held across I/O.
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    thread_id: Option<String>,
    room_id: Option<String>,
    subprotocol: Option<String>,
    connected_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    live: Mutex<Live>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: ConnectionId::generate(),
            user_id: user_id.into(),
            thread_id: None,
            room_id: None,
            subprotocol: None,
            connected_at: Utc::now(),
            transport,
            live: Mutex::new(Live {
                state: ConnectionState::Connecting,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                latency_ms: None,
                close_code: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_room(mut self, room_id: Option<String>) -> Self {
        self.room_id = room_id;
        self
    }

    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    /// Tie the connection's lifetime to a parent token (server shutdown).
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        self.live.lock().state
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.live.lock().state = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// `true` once the registry has removed this connection. Never reverts.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        let mut live = self.live.lock();
        live.last_activity = Instant::now();
        live.last_activity_at = Utc::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.live.lock().last_activity
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.live.lock().last_activity_at
    }

    pub fn set_latency(&self, rtt: Duration) {
        self.live.lock().latency_ms = Some(rtt.as_millis() as u64);
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.live.lock().latency_ms
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send a frame over the transport. Fails fast once the connection is
    /// no longer open.
    pub async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.transport.send(frame).await
    }

    /// Token cancelled when the connection must stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the connection task to close with `code` and exit.
    ///
    /// The first recorded code wins. Safe to call from any task.
    pub fn shutdown(&self, code: CloseCode) {
        {
            let mut live = self.live.lock();
            if live.close_code.is_none() {
                live.close_code = Some(code);
            }
            if live.state != ConnectionState::Closed {
                live.state = ConnectionState::Draining;
            }
        }
        self.cancel.cancel();
    }

    /// Close code requested through [`Connection::shutdown`], if any.
    pub fn pending_close(&self) -> Option<CloseCode> {
        self.live.lock().close_code
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("c-"));
    }

    #[tokio::test]
    async fn send_requires_open() {
        let transport = Arc::new(MemoryTransport::new());
        let conn = Connection::new("alice", transport.clone());
        assert_eq!(
            conn.send(Bytes::from_static(b"x")).await,
            Err(SendError::Closed)
        );

        conn.set_state(ConnectionState::Open);
        conn.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn first_shutdown_code_wins() {
        let conn = Connection::new("alice", Arc::new(MemoryTransport::new()));
        conn.set_state(ConnectionState::Open);
        conn.shutdown(CloseCode::REPLACED);
        conn.shutdown(CloseCode::GOING_AWAY);

        assert_eq!(conn.pending_close(), Some(CloseCode::REPLACED));
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert!(conn.cancel_token().is_cancelled());
    }
}
