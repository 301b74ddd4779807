//! HTTP side-car: Prometheus metrics, publish ingress and inspection.
//!
//! Runs on its own tokio task next to the WebSocket gateway.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::state::{Hub, HubStats, PresenceState, SharedStateSnapshot, TabRegistration, UserSession};

/// Body of `GET /presence/:user_id`.
#[derive(Debug, Serialize)]
pub struct PresenceView {
    pub user_id: String,
    pub presence: PresenceState,
    pub session: Option<UserSession>,
}

/// Body of `GET /tabs/:user_id`.
#[derive(Debug, Serialize)]
pub struct TabsView {
    pub user_id: String,
    pub leader_tab_id: Option<String>,
    pub tabs: Vec<TabRegistration>,
    pub shared_state: Option<SharedStateSnapshot>,
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/publish/:user_id", post(publish_handler))
        .route("/presence/:user_id", get(presence_handler))
        .route("/tabs/:user_id", get(tabs_handler))
        .route("/sessions/:user_id", axum::routing::delete(close_session_handler))
        .with_state(hub)
}

/// Handler for GET /metrics - returns Prometheus metrics in text format.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

/// GET /stats - hub counters and sizes.
pub async fn stats_handler(State(hub): State<Arc<Hub>>) -> Json<HubStats> {
    Json(hub.stats())
}

/// POST /publish/:user_id - enqueue the request body as one event.
pub async fn publish_handler(
    State(hub): State<Arc<Hub>>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if user_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_user" })),
        ));
    }
    if body.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "empty_payload" })),
        ));
    }
    let seq = hub.publish(&user_id, body);
    Ok((StatusCode::ACCEPTED, Json(json!({ "user_id": user_id, "seq": seq }))))
}

/// GET /presence/:user_id
pub async fn presence_handler(
    State(hub): State<Arc<Hub>>,
    Path(user_id): Path<String>,
) -> Json<PresenceView> {
    Json(PresenceView {
        presence: hub.presence.get_presence(&user_id),
        session: hub.presence.session(&user_id),
        user_id,
    })
}

/// GET /tabs/:user_id
pub async fn tabs_handler(
    State(hub): State<Arc<Hub>>,
    Path(user_id): Path<String>,
) -> Json<TabsView> {
    Json(TabsView {
        leader_tab_id: hub.tabs.leader(&user_id).map(|t| t.tab_id),
        tabs: hub.tabs.tabs(&user_id),
        shared_state: hub.tabs.shared_state(&user_id),
        user_id,
    })
}

/// DELETE /sessions/:user_id - drop queued events and close every connection.
pub async fn close_session_handler(
    State(hub): State<Arc<Hub>>,
    Path(user_id): Path<String>,
) -> Json<Value> {
    let closed = hub.close_user(&user_id);
    Json(json!({ "user_id": user_id, "closed_connections": closed }))
}

/// Run the HTTP side-car until `shutdown` is cancelled.
///
/// Binds to `0.0.0.0:port`. A bind failure is logged and ends the task.
pub async fn run_http_server(port: u16, hub: Arc<Hub>, shutdown: CancellationToken) {
    let app = router(hub);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind HTTP server on {}: {}", addr, e);
            return;
        }
    };
    tracing::info!("HTTP side-car listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!("HTTP server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::Connection;
    use crate::transport::MemoryTransport;

    fn hub() -> Arc<Hub> {
        let mut config = Config::default();
        config.session.offline_debounce_ms = 0;
        Hub::in_memory(config).unwrap()
    }

    #[tokio::test]
    async fn publish_returns_sequence() {
        let hub = hub();
        let (status, Json(body)) = publish_handler(
            State(hub.clone()),
            Path("alice".to_string()),
            Bytes::from_static(br#"{"kind":"started"}"#),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["seq"], 1);
        assert_eq!(hub.queue.pending_len("alice"), 1);
    }

    #[tokio::test]
    async fn publish_rejects_empty_body() {
        let (status, _) = publish_handler(State(hub()), Path("alice".to_string()), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn presence_reports_session() {
        let hub = hub();
        let conn = Arc::new(Connection::new("bob", Arc::new(MemoryTransport::new())));
        hub.attach(conn.clone()).unwrap();

        let Json(view) = presence_handler(State(hub.clone()), Path("bob".to_string())).await;
        assert_eq!(view.presence, PresenceState::Online);
        let session = view.session.unwrap();
        assert_eq!(session.connection_ids, vec![conn.id().clone()]);

        let Json(view) = presence_handler(State(hub), Path("nobody".to_string())).await;
        assert_eq!(view.presence, PresenceState::Offline);
        assert!(view.session.is_none());
    }

    #[tokio::test]
    async fn close_session_disconnects() {
        let hub = hub();
        let conn = Arc::new(Connection::new("carol", Arc::new(MemoryTransport::new())));
        hub.attach(conn.clone()).unwrap();

        let Json(body) = close_session_handler(State(hub.clone()), Path("carol".to_string())).await;
        assert_eq!(body["closed_connections"], 1);
        assert!(conn.cancel_token().is_cancelled());

        let Json(stats) = stats_handler(State(hub)).await;
        assert_eq!(stats.connections, 0);
    }
}
