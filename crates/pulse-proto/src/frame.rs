//! JSON frames exchanged over a pulse WebSocket.
//!
//! Every frame is a JSON object with a `type` discriminator. Frames from the
//! client are [`ClientFrame`]s, frames from the server are [`ServerFrame`]s.
//! Event payloads are opaque to the protocol: the server splices the
//! pre-serialized bytes it was handed straight into the `event` frame.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::ProtocolError;

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Identity token, when it was not supplied during the HTTP upgrade.
    Auth {
        /// Opaque identity token.
        token: String,
    },
    /// Application-level heartbeat reply.
    Pong {
        /// Nonce of the ping being answered.
        nonce: u64,
    },
    /// Replay delivered events newer than `after_seq` to this connection.
    Resume {
        /// Last event sequence number the client has seen.
        after_seq: u64,
    },
    /// Join multi-tab coordination.
    RegisterTab {
        /// Client-chosen tab identifier.
        tab_id: String,
    },
    /// Leave multi-tab coordination.
    UnregisterTab {
        /// Tab identifier previously registered.
        tab_id: String,
    },
    /// Merge keys into the user's shared cross-tab state.
    SyncState {
        /// Tab that produced the update.
        tab_id: String,
        /// Keys to merge. Object values may carry a numeric `timestamp`.
        updates: Map<String, Value>,
    },
    /// A user action that may be submitted redundantly by several tabs.
    Action {
        /// Tab submitting the action.
        tab_id: String,
        /// Action category (e.g. `tool`).
        kind: String,
        /// Verb within the category (e.g. `approve`).
        action: String,
        /// Object the action applies to.
        #[serde(default)]
        target: String,
        /// Client timestamp in milliseconds; the server clock is used when absent.
        #[serde(default)]
        at_ms: Option<i64>,
        /// Only the leader tab may perform this action.
        #[serde(default)]
        leader_only: bool,
        /// Opaque action body handed to business logic.
        #[serde(default)]
        payload: Value,
    },
}

/// Reconnect schedule advertised to clients in the `welcome` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectAdvice {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any retry delay.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Relative random spread applied to each delay.
    pub jitter_factor: f64,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame after a successful admission.
    Welcome {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Authenticated user.
        user_id: String,
        /// Interval between server pings.
        heartbeat_interval_ms: u64,
        /// Retry schedule the client should follow after a drop.
        reconnect: ReconnectAdvice,
    },
    /// A queued business event.
    Event {
        /// Per-user sequence number, strictly increasing.
        seq: u64,
        /// The event as handed to the server.
        payload: Value,
    },
    /// Application-level heartbeat for clients that cannot see protocol pings.
    Ping {
        /// Nonce to echo in the matching `pong`.
        nonce: u64,
    },
    /// Result of `register_tab`.
    TabRegistered {
        /// The tab that registered.
        tab_id: String,
        /// Whether the tab holds leadership.
        is_leader: bool,
        /// Tabs registered for the user, including this one.
        total_tabs: usize,
    },
    /// Result of `unregister_tab`.
    TabUnregistered {
        /// The tab that left.
        tab_id: String,
        /// Whether the tab was the leader.
        was_leader: bool,
        /// Tabs still registered for the user.
        remaining_tabs: usize,
    },
    /// Leadership moved to another tab.
    LeadershipChanged {
        /// The new leader.
        leader_tab_id: String,
    },
    /// Shared state after a merge.
    StateSync {
        /// Version after the merge.
        version: u64,
        /// Tab whose update produced this version.
        source_tab_id: String,
        /// Conflicts resolved so far for this user.
        conflict_count: u64,
        /// Full merged state.
        state: Map<String, Value>,
    },
    /// An action was accepted and forwarded.
    ActionAccepted {
        /// Fingerprint of the action.
        fingerprint: String,
    },
    /// An action was dropped as a duplicate of one seen recently.
    Duplicate {
        /// Fingerprint of the action.
        fingerprint: String,
    },
    /// Advisory sent before a server-initiated close.
    Reconnect {
        /// Consecutive reconnect attempt this advice is for.
        attempt: u32,
        /// How long to wait before reconnecting.
        delay_ms: u64,
        /// The attempt budget is exhausted; show a terminal failure.
        give_up: bool,
    },
    /// A request failed.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl ClientFrame {
    /// Decode a client frame, enforcing a size limit.
    pub fn decode(text: &str, max_len: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_len {
            return Err(ProtocolError::Oversized {
                len: text.len(),
                max: max_len,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Frame type name for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Pong { .. } => "pong",
            Self::Resume { .. } => "resume",
            Self::RegisterTab { .. } => "register_tab",
            Self::UnregisterTab { .. } => "unregister_tab",
            Self::SyncState { .. } => "sync_state",
            Self::Action { .. } => "action",
        }
    }

    /// Serialize to JSON text.
    pub fn to_text(&self) -> String {
        // Map keys are strings and values are JSON already; this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerFrame {
    /// Serialize to JSON text.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Build an `error` frame.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl FromStr for ClientFrame {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

impl FromStr for ServerFrame {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Encode an `event` frame around an opaque payload.
///
/// A payload that is valid JSON is spliced in verbatim; anything else is sent
/// as a JSON string so the frame itself always stays valid.
pub fn encode_event(seq: u64, payload: &[u8]) -> String {
    match serde_json::from_slice::<&RawValue>(payload) {
        Ok(raw) => format!(r#"{{"type":"event","seq":{},"payload":{}}}"#, seq, raw.get()),
        Err(_) => {
            let text = String::from_utf8_lossy(payload);
            let quoted = serde_json::to_string(text.as_ref()).unwrap_or_else(|_| "null".into());
            format!(r#"{{"type":"event","seq":{},"payload":{}}}"#, seq, quoted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_decode_with_defaults() {
        let frame: ClientFrame =
            r#"{"type":"action","tab_id":"t1","kind":"tool","action":"approve"}"#
                .parse()
                .unwrap();
        match frame {
            ClientFrame::Action {
                target,
                at_ms,
                leader_only,
                payload,
                ..
            } => {
                assert_eq!(target, "");
                assert_eq!(at_ms, None);
                assert!(!leader_only);
                assert_eq!(payload, Value::Null);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = r#"{"type":"subscribe"}"#.parse::<ClientFrame>().unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");
    }

    #[test]
    fn oversized_frame_rejected_before_parsing() {
        let text = r#"{"type":"pong","nonce":1}"#;
        let err = ClientFrame::decode(text, 4).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { max: 4, .. }));
        assert!(ClientFrame::decode(text, 1024).is_ok());
    }

    #[test]
    fn event_splices_json_payload() {
        let text = encode_event(3, br#"{"kind":"thinking","step":2}"#);
        assert_eq!(
            text,
            r#"{"type":"event","seq":3,"payload":{"kind":"thinking","step":2}}"#
        );
        let frame: ServerFrame = text.parse().unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                seq: 3,
                payload: json!({"kind": "thinking", "step": 2}),
            }
        );
    }

    #[test]
    fn event_quotes_non_json_payload() {
        let text = encode_event(1, b"plain \"text\"");
        let frame: ServerFrame = text.parse().unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                seq: 1,
                payload: json!("plain \"text\""),
            }
        );
    }

    #[test]
    fn server_frame_tags_are_snake_case() {
        let text = ServerFrame::LeadershipChanged {
            leader_tab_id: "t2".into(),
        }
        .to_text();
        assert_eq!(text, r#"{"type":"leadership_changed","leader_tab_id":"t2"}"#);
    }
}
