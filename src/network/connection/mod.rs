//! Connection task - one per accepted socket.
//!
//! ```text
//! Phase 1: Admission (upgrade, token, registration; one deadline)
//!    ↓
//! Phase 2: Event loop (tokio::select!)
//!    ┌──────────────────────────────────────────────────────┐
//!    │  ws.next() ──► dispatch ──► hub components           │
//!    │  outbound mailbox ──► ws.send() ──► ack to sender    │
//!    │  heartbeat tick ──► ping / idle / timeout            │
//!    │  cancel token ──► reconnect advice + close frame     │
//!    └──────────────────────────────────────────────────────┘
//!    ↓
//! Phase 3: Detach from the hub, record the close reason
//! ```
//!
//! The task is the only writer of its WebSocket. Other tasks reach the
//! client through the connection's [`ChannelTransport`](crate::transport::ChannelTransport).

mod context;
mod dispatch;
mod event_loop;
mod handshake;

use context::ConnectionContext;
use event_loop::run_event_loop;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tracing::{Instrument, info};

use crate::error::AdmissionError;
use crate::metrics;
use crate::state::Hub;
use crate::telemetry::{Event, spans};

pub(crate) type WsStream = WebSocketStream<TcpStream>;

/// Serve one accepted TCP stream until the client or the server ends it.
pub async fn serve(stream: TcpStream, addr: SocketAddr, hub: Arc<Hub>) -> Result<(), AdmissionError> {
    let admitted = match handshake::admit(stream, addr, &hub).await {
        Ok(admitted) => admitted,
        Err(e) => {
            hub.telemetry.record(Event::AdmissionRejected);
            metrics::record_admission_rejected(e.error_code());
            return Err(e);
        }
    };

    let handshake::Admitted {
        mut ws,
        conn,
        mut outbound,
    } = admitted;
    let span = spans::connection(conn.id().as_str(), conn.user_id(), addr);
    let mut ctx = ConnectionContext::new(hub.clone(), conn.clone(), addr);

    let exit = run_event_loop(&mut ws, &mut ctx, &mut outbound)
        .instrument(span.clone())
        .await;

    // Pending senders see `Closed` once the mailbox is dropped.
    drop(outbound);
    hub.detach(conn.id().as_str());
    metrics::record_close(exit.reason);
    span.in_scope(|| info!(reason = exit.reason, "connection closed"));
    Ok(())
}
