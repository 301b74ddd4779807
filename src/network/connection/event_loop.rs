use futures_util::{SinkExt, StreamExt};
use pulse_proto::{CloseCode, ServerFrame};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::WsStream;
use super::context::ConnectionContext;
use super::dispatch::{DispatchResult, malformed, process_text};
use crate::state::HeartbeatAction;
use crate::telemetry::Event;
use crate::transport::{Outbound, SendError};

enum SelectResult {
    /// No action needed, continue loop
    None,
    /// A text frame from the client
    Inbound(String),
    /// Write frames and continue loop
    Continue { pending_writes: Vec<ServerFrame> },
    /// A frame handed over by the delivery path
    Outgoing(Outbound),
    /// Send a heartbeat ping
    SendPing(u64),
    /// Close the socket with this code and stop
    Close(CloseCode),
    /// The peer is gone; nothing more can be written
    Gone(&'static str),
}

/// Why the event loop stopped. Used as the close metric label.
pub(super) struct LoopExit {
    pub reason: &'static str,
}

fn process_read_result(
    ctx: &mut ConnectionContext,
    result: Option<Result<Message, WsError>>,
) -> SelectResult {
    match result {
        Some(Ok(Message::Text(text))) => SelectResult::Inbound(text),
        Some(Ok(Message::Binary(_))) => {
            match malformed(ctx, "unsupported_frame", "binary frames are not supported") {
                DispatchResult::Close(code) => SelectResult::Close(code),
                DispatchResult::Reply(pending_writes) => SelectResult::Continue { pending_writes },
                DispatchResult::Continue => SelectResult::None,
            }
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
            ctx.conn.touch();
            SelectResult::None
        }
        Some(Ok(Message::Close(frame))) => {
            debug!(?frame, "client closed");
            SelectResult::Gone("client_closed")
        }
        Some(Err(e)) => {
            debug!(error = %e, "read error");
            SelectResult::Gone("read_error")
        }
        None => {
            info!("client disconnected");
            SelectResult::Gone("client_closed")
        }
    }
}

fn check_heartbeat(ctx: &mut ConnectionContext) -> SelectResult {
    let now = Instant::now();
    let change = ctx.heartbeat.poll_idle(now);
    ctx.apply_idle(change);

    match ctx.heartbeat.on_tick(now) {
        HeartbeatAction::None => SelectResult::None,
        HeartbeatAction::SendPing(nonce) => SelectResult::SendPing(nonce),
        HeartbeatAction::Dead => {
            warn!(
                unanswered = ctx.heartbeat.unanswered(),
                "heartbeat timeout - disconnecting"
            );
            ctx.hub.telemetry.record(Event::HeartbeatTimeout);
            SelectResult::Close(CloseCode::HEARTBEAT_TIMEOUT)
        }
    }
}

fn to_message(frame: &ServerFrame) -> Message {
    Message::Text(frame.to_text())
}

/// Run the connection until the client leaves or the server closes it.
pub(super) async fn run_event_loop(
    ws: &mut WsStream,
    ctx: &mut ConnectionContext,
    outbound: &mut mpsc::Receiver<Outbound>,
) -> LoopExit {
    let mut check_timer = tokio::time::interval(ctx.hub.heartbeat.check_interval());
    // First tick fires immediately, we don't want that
    check_timer.tick().await;

    let welcome = ServerFrame::Welcome {
        connection_id: ctx.conn.id().to_string(),
        user_id: ctx.user_id().to_string(),
        heartbeat_interval_ms: ctx.hub.heartbeat.ping_interval().as_millis() as u64,
        reconnect: ctx.hub.policy.advice(),
    };
    if let Err(e) = ws.send(to_message(&welcome)).await {
        warn!(error = %e, "failed to send welcome");
        return LoopExit { reason: "write_error" };
    }

    let cancel = ctx.conn.cancel_token().clone();

    loop {
        let select_result = tokio::select! {
            result = ws.next() => process_read_result(ctx, result),

            Some(cmd) = outbound.recv() => SelectResult::Outgoing(cmd),

            _ = check_timer.tick() => check_heartbeat(ctx),

            _ = cancel.cancelled() => {
                let code = ctx.conn.pending_close().unwrap_or(CloseCode::GOING_AWAY);
                debug!(code = code.0, "connection cancelled");
                SelectResult::Close(code)
            }
        };

        match select_result {
            SelectResult::None => continue,

            SelectResult::Inbound(text) => match process_text(ctx, &text).await {
                DispatchResult::Continue => continue,
                DispatchResult::Reply(frames) => {
                    for frame in &frames {
                        if ws.send(to_message(frame)).await.is_err() {
                            return LoopExit { reason: "write_error" };
                        }
                    }
                }
                DispatchResult::Close(code) => {
                    close_with(ws, ctx, code).await;
                    return LoopExit {
                        reason: close_reason(code),
                    };
                }
            },

            SelectResult::Continue { pending_writes } => {
                for frame in &pending_writes {
                    if ws.send(to_message(frame)).await.is_err() {
                        return LoopExit { reason: "write_error" };
                    }
                }
            }

            SelectResult::Outgoing(Outbound::Frame { data, ack }) => {
                let msg = match String::from_utf8(data.to_vec()) {
                    Ok(text) => Message::Text(text),
                    Err(e) => Message::Binary(e.into_bytes()),
                };
                let result = ws
                    .send(msg)
                    .await
                    .map_err(|e| SendError::Io(e.to_string()));
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    warn!("write error");
                    return LoopExit { reason: "write_error" };
                }
            }

            SelectResult::Outgoing(Outbound::Close { code, reason }) => {
                debug!(code = code.0, reason = %reason, "close requested by transport");
                close_with(ws, ctx, code).await;
                return LoopExit {
                    reason: close_reason(code),
                };
            }

            SelectResult::SendPing(nonce) => {
                if let Err(e) = ws.send(to_message(&ServerFrame::Ping { nonce })).await {
                    warn!(error = %e, "failed to send ping");
                    ctx.heartbeat.on_send_failure();
                    ctx.hub.telemetry.record(Event::HeartbeatTimeout);
                    return LoopExit {
                        reason: "heartbeat_timeout",
                    };
                }
            }

            SelectResult::Close(code) => {
                close_with(ws, ctx, code).await;
                return LoopExit {
                    reason: close_reason(code),
                };
            }

            SelectResult::Gone(reason) => return LoopExit { reason },
        }
    }
}

/// Send reconnect advice and a close frame, bounded by the send timeout.
async fn close_with(ws: &mut WsStream, ctx: &ConnectionContext, code: CloseCode) {
    let advice = ctx.hub.reconnect_advice(ctx.user_id(), code);
    let frame = CloseFrame {
        code: code.0.into(),
        reason: code.reason().into(),
    };
    let goodbye = async {
        ws.send(to_message(&advice)).await?;
        ws.close(Some(frame)).await
    };
    match tokio::time::timeout(ctx.hub.config.limits.send_timeout(), goodbye).await {
        Ok(Ok(())) => debug!(code = code.0, "close sent"),
        Ok(Err(e)) => debug!(code = code.0, error = %e, "close failed"),
        Err(_) => debug!(code = code.0, "close timed out"),
    }
}

fn close_reason(code: CloseCode) -> &'static str {
    match code {
        CloseCode::NORMAL => "normal",
        CloseCode::GOING_AWAY => "shutdown",
        CloseCode::HEARTBEAT_TIMEOUT => "heartbeat_timeout",
        CloseCode::REPLACED => "replaced",
        CloseCode::SESSION_CLOSED => "session_closed",
        CloseCode::BREAKER_OPEN => "breaker_open",
        CloseCode::PROTOCOL_ERROR => "protocol_error",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_are_metric_safe() {
        assert_eq!(close_reason(CloseCode::HEARTBEAT_TIMEOUT), "heartbeat_timeout");
        assert_eq!(close_reason(CloseCode::BREAKER_OPEN), "breaker_open");
        assert_eq!(close_reason(CloseCode(4999)), "other");
    }
}
