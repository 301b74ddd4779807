//! Unified error handling for pulsed.
//!
//! Each component returns its own typed error. Every error exposes a static
//! `error_code()` used for metric labels and for the `code` field of `error`
//! frames sent back to clients.

use pulse_proto::{CloseCode, ProtocolError};
use thiserror::Error;

use crate::auth::AuthError;

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors returned by the connection registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid user id")]
    InvalidUser,

    #[error("connection {0} is already registered")]
    Duplicate(String),
}

impl RegistryError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUser => "invalid_user",
            Self::Duplicate(_) => "duplicate_connection",
        }
    }
}

// ============================================================================
// Multi-Tab Errors
// ============================================================================

/// Errors returned by the multi-tab coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TabError {
    #[error("tab {0} is not the leader")]
    NotLeader(String),

    #[error("tab {0} is not registered")]
    UnknownTab(String),

    #[error("user id and tab id must be non-empty")]
    InvalidTab,

    #[error("connection {0} is no longer registered")]
    ConnectionGone(String),
}

impl TabError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotLeader(_) => "not_leader",
            Self::UnknownTab(_) => "unknown_tab",
            Self::InvalidTab => "invalid_tab",
            Self::ConnectionGone(_) => "connection_gone",
        }
    }
}

// ============================================================================
// Client Action Errors
// ============================================================================

/// Why a client action was not carried out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Tab(#[from] TabError),

    #[error("action rejected: {0}")]
    Rejected(String),
}

impl ActionError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Tab(e) => e.error_code(),
            Self::Rejected(_) => "action_rejected",
        }
    }
}

// ============================================================================
// Reconnect Policy Errors
// ============================================================================

/// Rejected reconnect policy parameters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    #[error("backoff multiplier must be a positive number, got {0}")]
    InvalidMultiplier(f64),

    #[error("jitter factor must be in [0, 1), got {0}")]
    InvalidJitter(f64),

    #[error("initial delay {initial}ms exceeds max delay {max}ms")]
    InitialExceedsMax { initial: u64, max: u64 },
}

impl PolicyError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidMultiplier(_) => "invalid_multiplier",
            Self::InvalidJitter(_) => "invalid_jitter",
            Self::InitialExceedsMax { .. } => "initial_exceeds_max",
        }
    }
}

// ============================================================================
// Admission Errors (handshake + authentication)
// ============================================================================

/// Reasons a connection never makes it into the registry.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("connection rate limit exceeded")]
    RateLimited,

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("no identity token before the handshake deadline")]
    AuthTimeout,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("expected an auth frame, got {0}")]
    UnexpectedFrame(&'static str),

    #[error("client closed before authenticating")]
    ClientGone,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AdmissionError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Handshake(_) => "handshake_failed",
            Self::AuthTimeout => "auth_timeout",
            Self::Auth(e) => e.error_code(),
            Self::Protocol(e) => e.error_code(),
            Self::UnexpectedFrame(_) => "unexpected_frame",
            Self::ClientGone => "client_gone",
            Self::Registry(e) => e.error_code(),
        }
    }

    /// Close code sent to the client, if the WebSocket got far enough to carry one.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::RateLimited | Self::Handshake(_) | Self::ClientGone => None,
            Self::AuthTimeout => Some(CloseCode::AUTH_TIMEOUT),
            Self::Auth(_) => Some(CloseCode::AUTH_FAILED),
            Self::Protocol(_) | Self::UnexpectedFrame(_) => Some(CloseCode::PROTOCOL_ERROR),
            Self::Registry(_) => Some(CloseCode::POLICY),
        }
    }
}
