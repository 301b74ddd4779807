//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Root config struct, server identity and loading
//! - [`listen`]: WebSocket listener and handshake policy
//! - [`limits`]: Per-user caps, queue sizing and admission rate
//! - [`resilience`]: Heartbeat, reconnect schedule and circuit breaker tuning
//! - [`session`]: Presence debounce and multi-tab coordination
//! - [`store`]: Shared store backend and static token table
//! - [`validation`]: Startup checks that collect every problem at once

mod defaults;
mod limits;
mod listen;
mod resilience;
mod session;
mod store;
mod types;
pub mod validation;

pub use limits::LimitsConfig;
pub use listen::ListenConfig;
pub use resilience::{BreakerConfig, HeartbeatConfig, ReconnectConfig};
pub use session::{SessionConfig, TabsConfig};
pub use store::{AuthConfig, StoreBackend, StoreConfig};
pub use types::{Config, ConfigError, LogFormat, ServerConfig};
pub use validation::{MIN_QUEUE_CAPACITY, ValidationError, validate};
