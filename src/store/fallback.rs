//! Degrade-to-memory wrapper around a remote store.
//!
//! The first failed call against the primary store flips the wrapper into
//! degraded mode: that call and every later one are served by a local
//! [`MemoryStore`]. Connections never fail because the store did. Degradation
//! is sticky; cross-process coordination resumes after a restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{MemoryStore, SharedStore, StoreError};
use crate::telemetry::{Event, Telemetry};

pub struct FallbackStore {
    primary: Arc<dyn SharedStore>,
    local: MemoryStore,
    degraded: AtomicBool,
    telemetry: Arc<Telemetry>,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn SharedStore>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            primary,
            local: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            telemetry,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Switch to the local store. Logs once.
    pub fn degrade(&self, cause: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            self.telemetry.record(Event::StoreDegraded);
            tracing::warn!(
                backend = self.primary.backend_name(),
                error = %cause,
                "shared store failed; continuing with in-memory coordination only"
            );
        }
    }

    async fn run<'a, T, P, L>(&'a self, primary: P, local: L) -> Result<T, StoreError>
    where
        P: Future<Output = Result<T, StoreError>> + Send + 'a,
        L: Future<Output = Result<T, StoreError>> + Send + 'a,
    {
        if !self.is_degraded() {
            match primary.await {
                Ok(v) => return Ok(v),
                Err(e @ StoreError::WrongType(_)) => return Err(e),
                Err(e) => self.degrade(&e),
            }
        }
        local.await
    }
}

#[async_trait]
impl SharedStore for FallbackStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run(self.primary.get(key), self.local.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.run(self.primary.set(key, value, ttl), self.local.set(key, value, ttl))
            .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.run(
            self.primary.set_if_absent(key, value, ttl),
            self.local.set_if_absent(key, value, ttl),
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.run(self.primary.del(key), self.local.del(key)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.run(
            self.primary.hset(key, field, value),
            self.local.hset(key, field, value),
        )
        .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.run(self.primary.hdel(key, field), self.local.hdel(key, field))
            .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.run(self.primary.hgetall(key), self.local.hgetall(key))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.run(self.primary.expire(key, ttl), self.local.expire(key, ttl))
            .await
    }

    fn purge_expired(&self) -> usize {
        self.primary.purge_expired() + self.local.purge_expired()
    }

    fn backend_name(&self) -> &'static str {
        if self.is_degraded() {
            "memory (degraded)"
        } else {
            self.primary.backend_name()
        }
    }
}
