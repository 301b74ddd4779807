//! Admission: WebSocket upgrade, identity, registration.
//!
//! The whole phase runs against one deadline (`listen.handshake_timeout_ms`).
//! The token is taken from the upgrade request when present, otherwise the
//! first text frame must be `{"type":"auth","token":...}`.

use futures_util::{SinkExt, StreamExt};
use pulse_proto::websocket::{HandshakeResult, build_handshake_response, validate_handshake};
use pulse_proto::{ClientFrame, CloseCode, ServerFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};

use super::WsStream;
use crate::error::AdmissionError;
use crate::state::{Connection, Hub};
use crate::transport::{ChannelTransport, Outbound};

/// Frames buffered between the delivery path and the socket writer.
const OUTBOUND_CAPACITY: usize = 64;

/// A connection that passed admission and is already registered.
pub(super) struct Admitted {
    pub ws: WsStream,
    pub conn: Arc<Connection>,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Upgrade, authenticate and register one client.
///
/// Failures after the upgrade are reported to the client with the matching
/// close code before the error is returned.
pub(super) async fn admit(
    stream: TcpStream,
    addr: SocketAddr,
    hub: &Arc<Hub>,
) -> Result<Admitted, AdmissionError> {
    let listen = &hub.config.listen;
    let deadline = Instant::now() + listen.handshake_timeout();
    let policy = listen.handshake_config();

    let mut verdict: Option<HandshakeResult> = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let result = validate_handshake(req, &policy);
        let response = build_handshake_response(&result, response);
        verdict = Some(result);
        response
    };

    let upgraded = timeout_at(deadline, accept_hdr_async(stream, callback)).await;
    let mut ws = match upgraded {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            if let Some(HandshakeResult::Reject { status, reason }) = &verdict {
                info!(%addr, status, reason = %reason, "upgrade rejected");
            }
            return Err(AdmissionError::Handshake(e.to_string()));
        }
        Err(_) => return Err(AdmissionError::Handshake("upgrade timed out".to_string())),
    };

    let (subprotocol, token, mut params) = match verdict {
        Some(HandshakeResult::Accept {
            subprotocol,
            token,
            params,
            ..
        }) => (subprotocol, token, params),
        _ => (None, None, HashMap::new()),
    };

    let admitted = async {
        let token = match token {
            Some((token, source)) => {
                debug!(%addr, ?source, "token supplied with upgrade");
                token
            }
            None => await_auth_frame(&mut ws, deadline, listen.max_frame_bytes).await?,
        };

        let identity = timeout_at(deadline, hub.auth.validate(&token))
            .await
            .map_err(|_| AdmissionError::AuthTimeout)??;

        let (transport, outbound) =
            ChannelTransport::new(OUTBOUND_CAPACITY, hub.config.limits.send_timeout());
        let conn = Arc::new(
            Connection::new(identity.user_id, Arc::new(transport))
                .with_thread(params.remove("thread_id"))
                .with_room(params.remove("room_id"))
                .with_subprotocol(subprotocol)
                .with_parent(hub.shutdown_token()),
        );

        let registration = hub.attach(conn.clone())?;
        for old in &registration.evicted {
            debug!(connection_id = %old.id(), "replaced by {}", conn.id());
        }
        Ok::<_, AdmissionError>((conn, outbound))
    }
    .await;

    match admitted {
        Ok((conn, outbound)) => {
            info!(%addr, connection_id = %conn.id(), user_id = %conn.user_id(), "connection admitted");
            Ok(Admitted { ws, conn, outbound })
        }
        Err(e) => {
            warn!(%addr, error = %e, code = e.error_code(), "admission failed");
            if let Some(code) = e.close_code() {
                refuse(&mut ws, code, &e).await;
            }
            Err(e)
        }
    }
}

/// Wait for the first-frame `auth` message.
async fn await_auth_frame(
    ws: &mut WsStream,
    deadline: Instant,
    max_frame_bytes: usize,
) -> Result<String, AdmissionError> {
    loop {
        let msg = match timeout_at(deadline, ws.next()).await {
            Err(_) => return Err(AdmissionError::AuthTimeout),
            Ok(None) | Ok(Some(Err(_))) => return Err(AdmissionError::ClientGone),
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Text(text) => {
                return match ClientFrame::decode(&text, max_frame_bytes)? {
                    ClientFrame::Auth { token } => Ok(token),
                    other => Err(AdmissionError::UnexpectedFrame(other.kind())),
                };
            }
            Message::Binary(_) => return Err(AdmissionError::UnexpectedFrame("binary")),
            Message::Close(_) => return Err(AdmissionError::ClientGone),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

/// Tell the client why it is being turned away, then close.
async fn refuse(ws: &mut WsStream, code: CloseCode, err: &AdmissionError) {
    let error = ServerFrame::error(err.error_code(), err.to_string());
    let _ = ws.send(Message::Text(error.to_text())).await;
    let frame = CloseFrame {
        code: code.0.into(),
        reason: code.reason().into(),
    };
    let _ = ws.close(Some(frame)).await;
}
