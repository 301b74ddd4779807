//! Per-user limits and admission rate configuration.

use serde::Deserialize;
use std::time::Duration;

use super::defaults::{
    default_connection_burst, default_connection_rate, default_max_connections_per_user,
    default_queue_capacity_per_user, default_replay_window, default_send_timeout_ms,
};

/// Connection and delivery limits.
///
/// These caps keep a single user (or a single misbehaving client) from
/// exhausting memory or holding the delivery path hostage.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections per user (default: 10).
    /// Registering one more evicts the oldest.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Messages retained per user before the oldest unacknowledged one is
    /// dropped (default: 256).
    #[serde(default = "default_queue_capacity_per_user")]
    pub queue_capacity_per_user: usize,
    /// Delivered messages kept for `resume` replay (default: 64, 0 disables).
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
    /// Per-connection write deadline (default: 5000ms).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Sustained new connections per second per IP.
    #[serde(default = "default_connection_rate")]
    pub connection_rate_per_second: u32,
    /// Burst of new connections per IP before throttling.
    #[serde(default = "default_connection_burst")]
    pub connection_burst_per_ip: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: default_max_connections_per_user(),
            queue_capacity_per_user: default_queue_capacity_per_user(),
            replay_window: default_replay_window(),
            send_timeout_ms: default_send_timeout_ms(),
            connection_rate_per_second: default_connection_rate(),
            connection_burst_per_ip: default_connection_burst(),
        }
    }
}

impl LimitsConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
