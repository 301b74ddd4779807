//! Heartbeat, reconnect and circuit breaker tuning.

use serde::Deserialize;
use std::time::Duration;

use super::defaults::{
    default_backoff_multiplier, default_failure_threshold, default_half_open_max_calls,
    default_initial_delay_ms, default_jitter_factor, default_max_attempts, default_max_delay_ms,
    default_ping_interval_ms, default_pong_timeout_ms, default_reset_timeout_ms,
};

/// Liveness probing for open connections.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between pings (default: 25s).
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Time without any inbound traffic after which a connection is dead
    /// (default: 60s).
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Inactivity after which a connection counts as idle for presence.
    /// Zero disables idle detection.
    #[serde(default)]
    pub away_after_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            away_after_ms: 0,
        }
    }
}

impl HeartbeatConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn away_after(&self) -> Option<Duration> {
        (self.away_after_ms > 0).then(|| Duration::from_millis(self.away_after_ms))
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Relative spread in `[0, 1)` applied around each delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed (default: 30s).
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Concurrent trial calls while half-open (default: 1).
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}
