//! pulsed - Pulse Daemon
//!
//! WebSocket connection and session management for streaming AI-agent
//! progress events: connection registry, heartbeats, reconnect policy,
//! ordered per-user delivery, presence and multi-tab coordination.

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod network;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use state::Hub;
