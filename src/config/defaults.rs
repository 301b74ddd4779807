//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

use std::net::SocketAddr;

// =============================================================================
// Server / Listen Defaults
// =============================================================================

pub fn default_server_name() -> String {
    "pulsed".to_string()
}

pub fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

pub fn default_subprotocol() -> Option<String> {
    Some("pulse.v1".to_string())
}

pub fn default_handshake_timeout_ms() -> u64 {
    10_000
}

pub fn default_max_frame_bytes() -> usize {
    64 * 1024
}

// =============================================================================
// Heartbeat Defaults
// =============================================================================

pub fn default_ping_interval_ms() -> u64 {
    25_000
}

/// At least twice the ping interval so a single missed tick is tolerated.
pub fn default_pong_timeout_ms() -> u64 {
    60_000
}

// =============================================================================
// Reconnect Defaults
// =============================================================================

pub fn default_initial_delay_ms() -> u64 {
    1_000
}

pub fn default_max_delay_ms() -> u64 {
    30_000
}

pub fn default_backoff_multiplier() -> f64 {
    1.5
}

pub fn default_max_attempts() -> u32 {
    10
}

pub fn default_jitter_factor() -> f64 {
    0.2
}

// =============================================================================
// Limits Defaults
// =============================================================================

pub fn default_max_connections_per_user() -> usize {
    10
}

pub fn default_queue_capacity_per_user() -> usize {
    256
}

pub fn default_replay_window() -> usize {
    64
}

pub fn default_send_timeout_ms() -> u64 {
    5_000
}

pub fn default_connection_rate() -> u32 {
    5
}

pub fn default_connection_burst() -> u32 {
    20
}

// =============================================================================
// Session / Tabs Defaults
// =============================================================================

pub fn default_offline_debounce_ms() -> u64 {
    5_000
}

pub fn default_dedup_window_ms() -> u64 {
    5_000
}

pub fn default_state_ttl_secs() -> u64 {
    86_400
}

pub fn default_idle_retention_ms() -> u64 {
    3_600_000
}

pub fn default_sweep_interval_ms() -> u64 {
    60_000
}

// =============================================================================
// Breaker Defaults
// =============================================================================

pub fn default_failure_threshold() -> u32 {
    5
}

pub fn default_reset_timeout_ms() -> u64 {
    30_000
}

pub fn default_half_open_max_calls() -> u32 {
    1
}

// =============================================================================
// Store Defaults
// =============================================================================

pub fn default_key_prefix() -> String {
    "pulse".to_string()
}
