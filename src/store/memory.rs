//! Process-local store.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{SharedStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`SharedStore`]. Expired keys are dropped when next touched or
/// by [`SharedStore::purge_expired`], which the hub sweeper runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live slot for `key`, removing it first if it has expired.
    fn live(&self, key: &str) -> Option<Slot> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        self.entries.get(key).map(|r| r.value().clone())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let slot = Slot {
            value: Value::Str(value.to_string()),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(slot);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        if slot.is_expired(now) {
            *slot = Slot {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut slot.value {
            Value::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Value::Str(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut now_empty = false;
        if let Some(mut slot) = self.entries.get_mut(key) {
            if !slot.is_expired(now) {
                match &mut slot.value {
                    Value::Hash(map) => {
                        map.remove(field);
                        now_empty = map.is_empty();
                    }
                    Value::Str(_) => return Err(StoreError::WrongType(key.to_string())),
                }
            }
        }
        if now_empty {
            self.entries
                .remove_if(key, |_, slot| matches!(&slot.value, Value::Hash(m) if m.is_empty()));
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self.live(key) {
            None => Ok(HashMap::new()),
            Some(Slot {
                value: Value::Hash(map),
                ..
            }) => Ok(map),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
