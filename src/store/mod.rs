//! Shared key/value store used for cross-tab coordination.
//!
//! The multi-tab coordinator persists tab registrations, dedup fingerprints
//! and shared-state snapshots through [`SharedStore`]. Three backends exist:
//!
//! - [`MemoryStore`]: process-local, TTLs evaluated lazily on access
//! - [`RedisStore`]: shared across instances (`redis` feature)
//! - [`FallbackStore`]: wraps a remote store and degrades to memory when it fails

mod fallback;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use fallback::FallbackStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::telemetry::Telemetry;

/// Store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation failed: {0}")]
    Backend(String),

    #[error("key {0} holds a value of another type")]
    WrongType(String),
}

impl StoreError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "store_unavailable",
            Self::Backend(_) => "store_backend",
            Self::WrongType(_) => "store_wrong_type",
        }
    }
}

/// Generic key/value service with per-key TTL.
///
/// Modeled on the Redis command set: string keys (`GET`/`SET`/`SET NX`/`DEL`)
/// and hash keys (`HSET`/`HDEL`/`HGETALL`) with `EXPIRE`.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// `SET key value [EX ttl]`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// `SET key value NX EX ttl`. Returns `true` if the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Drop keys whose TTL has passed. Backends that expire keys on their
    /// own keep the default. Returns how many keys were removed.
    fn purge_expired(&self) -> usize {
        0
    }

    /// Short backend name for logs and `/stats`.
    fn backend_name(&self) -> &'static str;
}

/// Build the store described by the config, wrapped in a [`FallbackStore`]
/// when it is remote.
pub async fn connect(
    config: &StoreConfig,
    telemetry: Arc<Telemetry>,
) -> Result<Arc<dyn SharedStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => connect_redis(config, telemetry).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    config: &StoreConfig,
    telemetry: Arc<Telemetry>,
) -> Result<Arc<dyn SharedStore>, StoreError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable("store.url is not set".to_string()))?;
    let primary: Arc<dyn SharedStore> = match RedisStore::connect(url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "redis unavailable at startup; tab coordination is process-local");
            let fallback = FallbackStore::new(Arc::new(MemoryStore::new()), telemetry);
            fallback.degrade(&e);
            return Ok(Arc::new(fallback));
        }
    };
    Ok(Arc::new(FallbackStore::new(primary, telemetry)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _config: &StoreConfig,
    _telemetry: Arc<Telemetry>,
) -> Result<Arc<dyn SharedStore>, StoreError> {
    Err(StoreError::Unavailable(
        "built without the `redis` feature".to_string(),
    ))
}
