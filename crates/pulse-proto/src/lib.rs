//! # pulse-proto
//!
//! Wire protocol shared by the `pulsed` server and its clients.
//!
//! ## Features
//!
//! - JSON frame types for both directions ([`ClientFrame`], [`ServerFrame`])
//! - Application close codes used when the server tears a connection down
//! - Content-addressed action fingerprints for multi-tab deduplication
//! - WebSocket upgrade validation (origin allow-list, subprotocol negotiation,
//!   identity token extraction) behind the `tokio` feature
//!
//! ## Quick Start
//!
//! ```rust
//! use pulse_proto::{ClientFrame, ServerFrame};
//!
//! let frame: ClientFrame = r#"{"type":"register_tab","tab_id":"t1"}"#.parse().unwrap();
//! assert_eq!(frame, ClientFrame::RegisterTab { tab_id: "t1".into() });
//!
//! let text = pulse_proto::encode_event(7, br#"{"kind":"started"}"#);
//! let decoded: ServerFrame = text.parse().unwrap();
//! assert!(matches!(decoded, ServerFrame::Event { seq: 7, .. }));
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod close;
pub mod error;
pub mod fingerprint;
pub mod frame;
#[cfg(feature = "tokio")]
pub mod websocket;

pub use self::close::CloseCode;
pub use self::error::{ProtocolError, Result};
pub use self::fingerprint::Fingerprint;
pub use self::frame::{encode_event, ClientFrame, ReconnectAdvice, ServerFrame};
