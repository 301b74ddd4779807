//! Network listener configuration.

use pulse_proto::websocket::HandshakeConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use super::defaults::{
    default_handshake_timeout_ms, default_listen_address, default_max_frame_bytes,
    default_subprotocol,
};

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind to (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,
    /// Allowed origins for CORS (empty = allow all).
    #[serde(default)]
    pub allow_origins: Vec<String>,
    /// Reject upgrades that carry no `Origin` header.
    #[serde(default)]
    pub require_origin: bool,
    /// Subprotocol advertised to clients.
    #[serde(default = "default_subprotocol")]
    pub subprotocol: Option<String>,
    /// Time allowed for the HTTP upgrade and first-frame authentication.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Largest inbound text frame accepted.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            allow_origins: Vec::new(),
            require_origin: false,
            subprotocol: default_subprotocol(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ListenConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Handshake policy handed to the upgrade callback.
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            allowed_origins: self.allow_origins.clone(),
            require_origin: self.require_origin,
            subprotocol: self.subprotocol.clone(),
            ..HandshakeConfig::default()
        }
    }
}
