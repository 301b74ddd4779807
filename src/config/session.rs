//! Presence and multi-tab coordination configuration.

use serde::Deserialize;
use std::time::Duration;

use super::defaults::{
    default_dedup_window_ms, default_idle_retention_ms, default_offline_debounce_ms,
    default_state_ttl_secs, default_sweep_interval_ms,
};

/// Presence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Grace period after the last connection closes before the user is
    /// reported offline (default: 5s). Zero reports immediately.
    #[serde(default = "default_offline_debounce_ms")]
    pub offline_debounce_ms: u64,
    /// How long per-user bookkeeping (idle queue, offline presence record,
    /// reconnect streak) is kept once the user has no connection
    /// (default: 1h).
    #[serde(default = "default_idle_retention_ms")]
    pub idle_retention_ms: u64,
    /// Period of the background sweep that drops expired store keys and
    /// idle per-user state (default: 60s).
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offline_debounce_ms: default_offline_debounce_ms(),
            idle_retention_ms: default_idle_retention_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn offline_debounce(&self) -> Duration {
        Duration::from_millis(self.offline_debounce_ms)
    }

    pub fn idle_retention(&self) -> Duration {
        Duration::from_millis(self.idle_retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Multi-tab coordination configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TabsConfig {
    /// Width of the action dedup window and fingerprint bucket (default: 5s).
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Expiry of the per-user tab registry and shared state in the store
    /// (default: 24h).
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

impl Default for TabsConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
            state_ttl_secs: default_state_ttl_secs(),
        }
    }
}

impl TabsConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}
