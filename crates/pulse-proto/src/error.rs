//! Error types for the pulse wire protocol.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Errors raised while decoding or validating frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match any known frame type.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame exceeded the configured size limit.
    #[error("frame too large: {len} bytes (max {max})")]
    Oversized {
        /// Size of the offending frame.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    Binary,
}

impl ProtocolError {
    /// Static error code for metric labels and `error` frames.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_frame",
            Self::Oversized { .. } => "frame_too_large",
            Self::Binary => "binary_frame",
        }
    }
}
