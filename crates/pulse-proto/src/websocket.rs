//! WebSocket upgrade validation.
//!
//! Checks the `Origin` header against an allow-list, negotiates the
//! subprotocol and pulls the identity token out of the upgrade request.
//! A token may arrive in three places, checked in this order:
//!
//! 1. `Authorization: Bearer <token>`
//! 2. a `bearer.<token>` entry in `Sec-WebSocket-Protocol` (browsers cannot
//!    set headers on WebSocket requests)
//! 3. the configured query parameter (`?token=...`)
//!
//! When none is present the server expects an `auth` frame instead.

use std::collections::HashMap;
use std::fmt;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};

/// Prefix of the subprotocol entry that carries a token.
pub const BEARER_PROTOCOL_PREFIX: &str = "bearer.";

/// Configuration for upgrade validation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Allowed origins (empty allows all, `*` matches any).
    pub allowed_origins: Vec<String>,
    /// Whether an Origin header is required.
    pub require_origin: bool,
    /// Subprotocol advertised by the server.
    pub subprotocol: Option<String>,
    /// Query parameter that may carry the token.
    pub token_param: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            require_origin: false,
            subprotocol: Some("pulse.v1".to_string()),
            token_param: "token".to_string(),
        }
    }
}

/// Where the token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// `Authorization` header.
    Header,
    /// `Sec-WebSocket-Protocol` entry.
    Subprotocol,
    /// Query string.
    Query,
}

/// Result of upgrade validation.
#[derive(Debug)]
#[non_exhaustive]
pub enum HandshakeResult {
    /// Upgrade accepted.
    Accept {
        /// The subprotocol to echo back, if any.
        subprotocol: Option<String>,
        /// The client's origin, if provided.
        origin: Option<String>,
        /// Identity token and where it came from.
        token: Option<(String, TokenSource)>,
        /// Decoded query parameters other than the token.
        params: HashMap<String, String>,
    },
    /// Upgrade rejected.
    Reject {
        /// HTTP status code to return.
        status: u16,
        /// Human-readable rejection reason.
        reason: String,
    },
}

impl fmt::Display for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeResult::Accept {
                subprotocol,
                origin,
                token,
                ..
            } => {
                write!(f, "Accept")?;
                if let Some(proto) = subprotocol {
                    write!(f, " (protocol: {})", proto)?;
                }
                if let Some(orig) = origin {
                    write!(f, " (origin: {})", orig)?;
                }
                if let Some((_, source)) = token {
                    write!(f, " (token via {:?})", source)?;
                }
                Ok(())
            }
            HandshakeResult::Reject { status, reason } => {
                write!(f, "Reject {} - {}", status, reason)
            }
        }
    }
}

/// Validate an upgrade request against the configuration.
pub fn validate_handshake(req: &Request, config: &HandshakeConfig) -> HandshakeResult {
    let origin = req
        .headers()
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if config.require_origin && origin.is_none() {
        return HandshakeResult::Reject {
            status: 403,
            reason: "Origin header required".to_string(),
        };
    }

    if !config.allowed_origins.is_empty() {
        if let Some(ref origin_value) = origin {
            if !config
                .allowed_origins
                .iter()
                .any(|allowed| allowed == origin_value || allowed == "*")
            {
                return HandshakeResult::Reject {
                    status: 403,
                    reason: format!("Origin '{}' not allowed", origin_value),
                };
            }
        }
    }

    let requested: Vec<String> = req
        .headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let bearer_protocol = requested
        .iter()
        .find(|p| p.starts_with(BEARER_PROTOCOL_PREFIX))
        .cloned();

    let advertised = config
        .subprotocol
        .as_ref()
        .filter(|ours| requested.iter().any(|p| p == *ours))
        .cloned();

    // A browser fails the upgrade unless one of its requested protocols is echoed.
    let subprotocol = advertised.or_else(|| bearer_protocol.clone());

    let mut params = parse_query(req.uri().query().unwrap_or(""));

    let header_token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let query_token = params
        .remove(&config.token_param)
        .filter(|t| !t.is_empty());

    let token = if let Some(t) = header_token {
        Some((t, TokenSource::Header))
    } else if let Some(p) = bearer_protocol {
        let t = p[BEARER_PROTOCOL_PREFIX.len()..].to_string();
        (!t.is_empty()).then_some((t, TokenSource::Subprotocol))
    } else {
        query_token.map(|t| (t, TokenSource::Query))
    };

    HandshakeResult::Accept {
        subprotocol,
        origin,
        token,
        params,
    }
}

/// Turn a validation result into the upgrade response.
///
/// `response` is the response prepared by the WebSocket library; accepted
/// upgrades get the negotiated subprotocol added to it.
#[allow(clippy::result_large_err)]
pub fn build_handshake_response(
    result: &HandshakeResult,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    match result {
        HandshakeResult::Accept { subprotocol, .. } => {
            if let Some(proto) = subprotocol {
                let value = HeaderValue::from_str(proto).map_err(|_| {
                    reject(StatusCode::BAD_REQUEST, "invalid subprotocol".to_string())
                })?;
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
            Ok(response)
        }
        HandshakeResult::Reject { status, reason } => {
            let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::FORBIDDEN);
            Err(reject(code, reason.clone()))
        }
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason));
    *resp.status_mut() = status;
    resp
}

/// Parse `a=1&b=2` into a map, decoding `%XX` escapes and `+`.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
