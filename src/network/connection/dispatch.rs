//! Inbound frame dispatch.
//!
//! Decoded client frames are routed to the hub components here. Replies
//! addressed to the sending connection are returned to the event loop,
//! which writes them directly; nothing in this module waits on the
//! connection's own outbound mailbox.

use chrono::Utc;
use pulse_proto::{ClientFrame, CloseCode, ServerFrame};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::context::ConnectionContext;
use crate::metrics;
use crate::state::{ActionOutcome, ActionRequest};

/// Consecutive undecodable frames tolerated before the connection is closed.
pub(super) const MAX_MALFORMED: u8 = 3;

/// Result of processing a single frame.
pub(super) enum DispatchResult {
    /// Nothing to write.
    Continue,
    /// Write these frames to the client and keep going.
    Reply(Vec<ServerFrame>),
    /// Close the connection with this code.
    Close(CloseCode),
}

impl DispatchResult {
    fn reply(frame: ServerFrame) -> Self {
        Self::Reply(vec![frame])
    }
}

/// Handle one text frame from the client.
pub(super) async fn process_text(ctx: &mut ConnectionContext, text: &str) -> DispatchResult {
    let max = ctx.hub.config.listen.max_frame_bytes;
    match ClientFrame::decode(text, max) {
        Ok(frame) => {
            ctx.malformed = 0;
            metrics::record_frame(frame.kind());
            process_frame(ctx, frame).await
        }
        Err(e) => malformed(ctx, e.error_code(), &e.to_string()),
    }
}

/// Count a frame that could not be decoded.
pub(super) fn malformed(ctx: &mut ConnectionContext, code: &str, message: &str) -> DispatchResult {
    ctx.malformed = ctx.malformed.saturating_add(1);
    metrics::record_frame("malformed");
    warn!(addr = %ctx.addr, code, strikes = ctx.malformed, "malformed frame: {message}");
    if ctx.malformed >= MAX_MALFORMED {
        return DispatchResult::Close(CloseCode::PROTOCOL_ERROR);
    }
    DispatchResult::reply(ServerFrame::error(code, message))
}

async fn process_frame(ctx: &mut ConnectionContext, frame: ClientFrame) -> DispatchResult {
    let now = Instant::now();
    ctx.conn.touch();

    if let ClientFrame::Pong { nonce } = frame {
        on_pong(ctx, nonce, now);
        return DispatchResult::Continue;
    }

    let change = ctx.heartbeat.on_client_activity(now);
    ctx.apply_idle(change);

    let user_id = ctx.user_id().to_string();
    match frame {
        ClientFrame::Pong { .. } => DispatchResult::Continue,

        ClientFrame::Auth { .. } => DispatchResult::reply(ServerFrame::error(
            "unexpected_frame",
            "connection is already authenticated",
        )),

        ClientFrame::Resume { after_seq } => {
            // Replay goes through the outbound mailbox, which this task drains.
            let hub = ctx.hub.clone();
            let conn = ctx.conn.clone();
            tokio::spawn(async move {
                let sent = hub.queue.replay(&user_id, after_seq, &conn).await;
                debug!(connection_id = %conn.id(), after_seq, sent, "resume replayed");
            });
            DispatchResult::Continue
        }

        ClientFrame::RegisterTab { tab_id } => {
            match ctx.hub.tabs.register_tab_on(&tab_id, &ctx.conn).await {
                Ok(registered) => DispatchResult::reply(ServerFrame::TabRegistered {
                    tab_id,
                    is_leader: registered.is_leader,
                    total_tabs: registered.total_tabs,
                }),
                Err(e) => DispatchResult::reply(ServerFrame::error(e.error_code(), e.to_string())),
            }
        }

        ClientFrame::UnregisterTab { tab_id } => {
            match ctx.hub.tabs.unregister_tab(&user_id, &tab_id).await {
                Ok(outcome) => DispatchResult::reply(ServerFrame::TabUnregistered {
                    tab_id,
                    was_leader: outcome.was_leader,
                    remaining_tabs: outcome.remaining_tabs,
                }),
                Err(e) => DispatchResult::reply(ServerFrame::error(e.error_code(), e.to_string())),
            }
        }

        ClientFrame::SyncState { tab_id, updates } => {
            match ctx
                .hub
                .tabs
                .merge_shared_state(&user_id, &tab_id, updates)
                .await
            {
                Ok(snapshot) => DispatchResult::reply(ServerFrame::StateSync {
                    version: snapshot.version,
                    source_tab_id: tab_id,
                    conflict_count: snapshot.conflict_count,
                    state: snapshot.state,
                }),
                Err(e) => DispatchResult::reply(ServerFrame::error(e.error_code(), e.to_string())),
            }
        }

        ClientFrame::Action {
            tab_id,
            kind,
            action,
            target,
            at_ms,
            leader_only,
            payload,
        } => {
            let request = ActionRequest {
                user_id,
                tab_id,
                kind,
                action,
                target,
                at_ms: at_ms.unwrap_or_else(|| Utc::now().timestamp_millis()),
                leader_only,
                payload,
            };
            match ctx.hub.handle_action(request).await {
                Ok(ActionOutcome::Accepted(fp)) => DispatchResult::reply(ServerFrame::ActionAccepted {
                    fingerprint: fp.as_str().to_string(),
                }),
                Ok(ActionOutcome::Duplicate(fp)) => DispatchResult::reply(ServerFrame::Duplicate {
                    fingerprint: fp.as_str().to_string(),
                }),
                Err(e) => DispatchResult::reply(ServerFrame::error(e.error_code(), e.to_string())),
            }
        }
    }
}

fn on_pong(ctx: &mut ConnectionContext, nonce: u64, now: Instant) {
    let Some(rtt) = ctx.heartbeat.on_pong(nonce, now) else {
        debug!(nonce, "pong for unknown nonce");
        return;
    };
    ctx.conn.set_latency(rtt);
    metrics::observe(&metrics::HEARTBEAT_RTT, rtt.as_secs_f64());
    if !ctx.reported_healthy {
        ctx.reported_healthy = true;
        ctx.hub.connection_healthy(ctx.conn.user_id());
    }
}
