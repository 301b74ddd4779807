//! Shared store and authentication configuration.

use serde::Deserialize;
use std::collections::HashMap;

use super::defaults::default_key_prefix;

/// Which shared store backs multi-tab coordination.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map. State does not survive restarts.
    #[default]
    Memory,
    /// Redis, shared across instances. Requires the `redis` feature.
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection URL (e.g., "redis://127.0.0.1:6379").
    pub url: Option<String>,
    /// Prefix prepended to every key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Static token table for the built-in authenticator.
///
/// Deployments with a real identity provider plug in their own
/// `Authenticator` and leave this empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Token to user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}
