//! Outbound transport seam.
//!
//! Everything that writes to a client goes through [`Transport`]. The
//! production implementation, [`ChannelTransport`], hands frames to the
//! connection task that owns the WebSocket sink and waits for that task to
//! confirm the write. [`MemoryTransport`] records frames in memory and is used
//! by in-process embedders, benchmarks and tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pulse_proto::CloseCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Outcome of a failed send.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("transport closed")]
    Closed,

    #[error("send timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Io(String),
}

impl SendError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Io(_) => "io",
        }
    }
}

/// A bidirectional message-oriented client transport, outbound half.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame. Returns once the frame was accepted by the peer's socket.
    async fn send(&self, frame: Bytes) -> Result<(), SendError>;

    /// Begin closing the transport.
    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SendError>;
}

/// Commands consumed by the connection task.
#[derive(Debug)]
pub enum Outbound {
    Frame {
        data: Bytes,
        ack: oneshot::Sender<Result<(), SendError>>,
    },
    Close {
        code: CloseCode,
        reason: String,
    },
}

/// Transport backed by the connection task's mailbox.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    send_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport and the receiver the connection task drains.
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, send_timeout }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        let (ack, done) = oneshot::channel();
        let attempt = async {
            self.tx
                .send(Outbound::Frame { data: frame, ack })
                .await
                .map_err(|_| SendError::Closed)?;
            done.await.map_err(|_| SendError::Closed)?
        };
        tokio::time::timeout(self.send_timeout, attempt)
            .await
            .map_err(|_| SendError::Timeout)?
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SendError> {
        let cmd = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        tokio::time::timeout(self.send_timeout, self.tx.send(cmd))
            .await
            .map_err(|_| SendError::Timeout)?
            .map_err(|_| SendError::Closed)
    }
}

/// In-memory transport that records every frame.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    frames: Mutex<Vec<Bytes>>,
    closed: Mutex<Option<(CloseCode, String)>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail (simulates a dead peer).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Frames accepted so far, as UTF-8 text.
    pub fn sent_text(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn closed_with(&self) -> Option<(CloseCode, String)> {
        self.closed.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<(), SendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SendError::Io("simulated failure".to_string()));
        }
        if self.closed.lock().is_some() {
            return Err(SendError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SendError> {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some((code, reason.to_string()));
        }
        Ok(())
    }
}
