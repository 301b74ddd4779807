//! WebSocket close codes used by the server.
//!
//! Codes in the 4000-4999 range are application defined (RFC 6455 §7.4.2).
//! Clients use them to decide whether to run their reconnect loop.

/// A WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Server is shutting down.
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Generic policy violation.
    pub const POLICY: CloseCode = CloseCode(1008);
    /// No identity token arrived before the handshake deadline.
    pub const AUTH_TIMEOUT: CloseCode = CloseCode(4000);
    /// The identity token was rejected.
    pub const AUTH_FAILED: CloseCode = CloseCode(4001);
    /// The client sent something the protocol does not allow.
    pub const PROTOCOL_ERROR: CloseCode = CloseCode(4002);
    /// The connection missed its heartbeat deadline.
    pub const HEARTBEAT_TIMEOUT: CloseCode = CloseCode(4008);
    /// Evicted to make room for a newer connection of the same user.
    pub const REPLACED: CloseCode = CloseCode(4009);
    /// The user session was closed by the server.
    pub const SESSION_CLOSED: CloseCode = CloseCode(4010);
    /// Too many delivery failures on this connection.
    pub const BREAKER_OPEN: CloseCode = CloseCode(4013);

    /// Whether a client should retry after receiving this code.
    ///
    /// Authentication failures and explicit session closes are terminal.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::AUTH_FAILED | Self::SESSION_CLOSED | Self::POLICY)
    }

    /// Short human-readable reason sent alongside the code.
    pub fn reason(self) -> &'static str {
        match self {
            Self::NORMAL => "normal closure",
            Self::GOING_AWAY => "server shutting down",
            Self::POLICY => "policy violation",
            Self::AUTH_TIMEOUT => "authentication timeout",
            Self::AUTH_FAILED => "authentication failed",
            Self::PROTOCOL_ERROR => "protocol error",
            Self::HEARTBEAT_TIMEOUT => "heartbeat timeout",
            Self::REPLACED => "replaced by newer connection",
            Self::SESSION_CLOSED => "session closed",
            Self::BREAKER_OPEN => "too many delivery failures",
            _ => "closed",
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code.0
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        CloseCode(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_codes_are_not_retryable() {
        assert!(!CloseCode::AUTH_FAILED.is_retryable());
        assert!(!CloseCode::SESSION_CLOSED.is_retryable());
        assert!(CloseCode::HEARTBEAT_TIMEOUT.is_retryable());
        assert!(CloseCode::GOING_AWAY.is_retryable());
    }

    #[test]
    fn unknown_code_has_generic_reason() {
        assert_eq!(CloseCode(4999).reason(), "closed");
        assert_eq!(u16::from(CloseCode::REPLACED), 4009);
    }
}
