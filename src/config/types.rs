//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use super::defaults::default_server_name;
use super::limits::LimitsConfig;
use super::listen::ListenConfig;
use super::resilience::{BreakerConfig, HeartbeatConfig, ReconnectConfig};
use super::session::{SessionConfig, TabsConfig};
use super::store::{AuthConfig, StoreConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
///
/// Every section is optional; an empty file yields a runnable development
/// setup (in-memory store, no tokens, listener on :8080).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server identity and observability.
    #[serde(default)]
    pub server: ServerConfig,
    /// WebSocket listener.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Liveness probing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Retry schedule used for queue retries and advertised to clients.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Per-user caps and admission rate.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Presence transitions.
    #[serde(default)]
    pub session: SessionConfig,
    /// Multi-tab coordination.
    #[serde(default)]
    pub tabs: TabsConfig,
    /// Circuit breaker tuning for downstream dependencies.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Shared key/value store.
    #[serde(default)]
    pub store: StoreConfig,
    /// Static token table.
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Instance name, attached to logs and `/stats`.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Port for the HTTP side-car (`/metrics`, `/publish`, `/presence`, `/stats`).
    /// Disabled when unset.
    pub metrics_port: Option<u16>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            metrics_port: None,
            log_format: LogFormat::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.server.name, "pulsed");
        assert_eq!(config.heartbeat.ping_interval_ms, 25_000);
        assert_eq!(config.heartbeat.pong_timeout_ms, 60_000);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.limits.max_connections_per_user, 10);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = r#"
            [server]
            name = "edge-1"
            metrics_port = 9100
            log_format = "json"

            [heartbeat]
            ping_interval_ms = 1000
            pong_timeout_ms = 3000

            [reconnect]
            backoff_multiplier = 2.0

            [auth.tokens]
            "secret-a" = "alice"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.server.name, "edge-1");
        assert_eq!(config.server.metrics_port, Some(9100));
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.heartbeat.ping_interval_ms, 1000);
        assert_eq!(config.reconnect.backoff_multiplier, 2.0);
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.auth.tokens.get("secret-a").map(String::as_str), Some("alice"));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits]\nqueue_capacity_per_user = 8").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.limits.queue_capacity_per_user, 8);
    }

    #[test]
    fn bad_toml_is_parse_error() {
        let err = "[server\nname=".parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
