//! Identity token validation.
//!
//! The daemon never decides who a user is. It hands the token it received to
//! an [`Authenticator`] and trusts the verdict. [`StaticTokenAuthenticator`]
//! backs development deployments with a token table from the config file.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::AuthConfig;

/// Authentication failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    Expired,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "invalid_token",
            Self::Expired => "token_expired",
            Self::Unavailable(_) => "auth_unavailable",
        }
    }
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    /// Claims carried by the token, passed through untouched.
    pub claims: Map<String, Value>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            claims: Map::new(),
        }
    }
}

/// External identity collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validate `token`, returning the user it identifies.
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        if config.tokens.is_empty() {
            tracing::warn!("auth.tokens is empty; every connection will be rejected");
        }
        Self::new(config.tokens.clone())
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let user_id = self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        let mut identity = Identity::new(user_id.clone());
        identity
            .claims
            .insert("auth".to_string(), Value::String("static".to_string()));
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_table_lookup() {
        let auth = StaticTokenAuthenticator::new(HashMap::from([(
            "tok-a".to_string(),
            "alice".to_string(),
        )]));

        let identity = auth.validate("tok-a").await.unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(auth.validate("nope").await, Err(AuthError::InvalidToken));
    }
}
