//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{Config, StoreBackend};
use thiserror::Error;

/// Smallest per-user queue that can hold an in-flight head plus one
/// evictable message.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// Validation errors for configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("heartbeat.ping_interval_ms must be positive")]
    ZeroPingInterval,
    #[error("heartbeat.pong_timeout_ms ({pong}) must not be shorter than ping_interval_ms ({ping})")]
    PongShorterThanPing { ping: u64, pong: u64 },
    #[error("reconnect.backoff_multiplier must be a positive number, got {0}")]
    InvalidMultiplier(f64),
    #[error("reconnect.jitter_factor must be in [0, 1), got {0}")]
    InvalidJitter(f64),
    #[error("reconnect.initial_delay_ms ({initial}) exceeds max_delay_ms ({max})")]
    InitialExceedsMax { initial: u64, max: u64 },
    #[error("limits.{0} must be positive")]
    ZeroLimit(&'static str),
    #[error("limits.queue_capacity_per_user must be at least 2, got {0}")]
    QueueTooSmall(usize),
    #[error("session.{0} must be positive")]
    ZeroSession(&'static str),
    #[error("breaker.{0} must be positive")]
    ZeroBreaker(&'static str),
    #[error("store.url is required for the redis backend")]
    MissingStoreUrl,
    #[error("store.backend = \"redis\" requires building with the `redis` feature")]
    RedisUnavailable,
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.server.name.trim().is_empty() {
        errors.push(ValidationError::MissingServerName);
    }

    // Heartbeat
    let hb = &config.heartbeat;
    if hb.ping_interval_ms == 0 {
        errors.push(ValidationError::ZeroPingInterval);
    } else if hb.pong_timeout_ms < hb.ping_interval_ms {
        errors.push(ValidationError::PongShorterThanPing {
            ping: hb.ping_interval_ms,
            pong: hb.pong_timeout_ms,
        });
    } else if hb.pong_timeout_ms < hb.ping_interval_ms.saturating_mul(2) {
        tracing::warn!(
            ping_ms = hb.ping_interval_ms,
            pong_ms = hb.pong_timeout_ms,
            "pong timeout below twice the ping interval; one late pong will drop the connection"
        );
    }

    // Reconnect schedule
    let rc = &config.reconnect;
    if rc.backoff_multiplier.is_nan() || rc.backoff_multiplier <= 0.0 {
        errors.push(ValidationError::InvalidMultiplier(rc.backoff_multiplier));
    }
    if !(0.0..1.0).contains(&rc.jitter_factor) {
        errors.push(ValidationError::InvalidJitter(rc.jitter_factor));
    }
    if rc.initial_delay_ms > rc.max_delay_ms {
        errors.push(ValidationError::InitialExceedsMax {
            initial: rc.initial_delay_ms,
            max: rc.max_delay_ms,
        });
    }

    // Limits
    let limits = &config.limits;
    if limits.max_connections_per_user == 0 {
        errors.push(ValidationError::ZeroLimit("max_connections_per_user"));
    }
    if limits.queue_capacity_per_user < MIN_QUEUE_CAPACITY {
        errors.push(ValidationError::QueueTooSmall(limits.queue_capacity_per_user));
    }
    if limits.send_timeout_ms == 0 {
        errors.push(ValidationError::ZeroLimit("send_timeout_ms"));
    }
    if limits.connection_rate_per_second == 0 {
        errors.push(ValidationError::ZeroLimit("connection_rate_per_second"));
    }
    if limits.connection_burst_per_ip == 0 {
        errors.push(ValidationError::ZeroLimit("connection_burst_per_ip"));
    }

    // Session sweep
    if config.session.sweep_interval_ms == 0 {
        errors.push(ValidationError::ZeroSession("sweep_interval_ms"));
    }

    // Breaker
    if config.breaker.failure_threshold == 0 {
        errors.push(ValidationError::ZeroBreaker("failure_threshold"));
    }
    if config.breaker.half_open_max_calls == 0 {
        errors.push(ValidationError::ZeroBreaker("half_open_max_calls"));
    }

    // Store
    if config.store.backend == StoreBackend::Redis {
        if config.store.url.as_deref().is_none_or(str::is_empty) {
            errors.push(ValidationError::MissingStoreUrl);
        }
        if !cfg!(feature = "redis") {
            errors.push(ValidationError::RedisUnavailable);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = Config::default();
        config.heartbeat.ping_interval_ms = 10_000;
        config.heartbeat.pong_timeout_ms = 5_000;
        config.reconnect.backoff_multiplier = 0.0;
        config.reconnect.jitter_factor = 1.0;
        config.reconnect.initial_delay_ms = 60_000;
        config.limits.queue_capacity_per_user = 0;

        let errors = validate(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::PongShorterThanPing {
            ping: 10_000,
            pong: 5_000
        }));
        assert!(errors.contains(&ValidationError::InvalidMultiplier(0.0)));
        assert!(errors.contains(&ValidationError::InvalidJitter(1.0)));
        assert!(errors.contains(&ValidationError::InitialExceedsMax {
            initial: 60_000,
            max: 30_000
        }));
        assert!(errors.contains(&ValidationError::QueueTooSmall(0)));
    }

    #[test]
    fn single_slot_queue_rejected() {
        let mut config = Config::default();
        config.limits.queue_capacity_per_user = 1;
        assert_eq!(
            validate(&config).unwrap_err(),
            vec![ValidationError::QueueTooSmall(1)]
        );

        config.limits.queue_capacity_per_user = MIN_QUEUE_CAPACITY;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn zero_sweep_interval_rejected() {
        let mut config = Config::default();
        config.session.sweep_interval_ms = 0;
        assert!(
            validate(&config)
                .unwrap_err()
                .contains(&ValidationError::ZeroSession("sweep_interval_ms"))
        );
    }

    #[test]
    fn nan_multiplier_rejected() {
        let mut config = Config::default();
        config.reconnect.backoff_multiplier = f64::NAN;
        let errors = validate(&config).unwrap_err();
        assert!(matches!(errors[0], ValidationError::InvalidMultiplier(m) if m.is_nan()));
    }

    #[test]
    fn redis_backend_needs_url() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Redis;
        let errors = validate(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::MissingStoreUrl));
    }
}
