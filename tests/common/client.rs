//! Test WebSocket client.
//!
//! Sends client frames and asserts on decoded server frames.

use futures_util::{SinkExt, StreamExt};
use pulse_proto::{ClientFrame, ServerFrame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// What the client observed when the server ended the connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Closed {
    /// A close frame with this code.
    Code(u16),
    /// The stream ended without a close frame.
    Dropped,
}

/// A test WebSocket client.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws, _response) = connect_async(url).await?;
        Ok(Self { ws })
    }

    /// Connect with extra request headers.
    #[allow(dead_code)]
    pub async fn connect_with_headers(
        url: &str,
        headers: &[(&'static str, &str)],
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            if let Ok(value) = HeaderValue::from_str(value) {
                request.headers_mut().insert(*name, value);
            }
        }
        let (ws, _response) = connect_async(request).await?;
        Ok(Self { ws })
    }

    /// Send a client frame.
    pub async fn send(&mut self, frame: &ClientFrame) -> anyhow::Result<()> {
        self.send_raw(&frame.to_text()).await
    }

    /// Send raw text.
    pub async fn send_raw(&mut self, text: &str) -> anyhow::Result<()> {
        self.ws.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Receive a single frame from the server.
    pub async fn recv(&mut self) -> anyhow::Result<ServerFrame> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    /// Receive a frame with a timeout. Control frames are skipped.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<ServerFrame> {
        loop {
            let msg = timeout(dur, self.ws.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("connection ended"))??;
            match msg {
                Message::Text(text) => return Ok(text.parse()?),
                Message::Close(frame) => anyhow::bail!("connection closed: {frame:?}"),
                _ => continue,
            }
        }
    }

    /// Receive frames until the predicate returns true.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<Vec<ServerFrame>>
    where
        F: FnMut(&ServerFrame) -> bool,
    {
        let mut frames = Vec::new();
        loop {
            let frame = self.recv().await?;
            let done = predicate(&frame);
            frames.push(frame);
            if done {
                break;
            }
        }
        Ok(frames)
    }

    /// Consume the welcome frame.
    pub async fn expect_welcome(&mut self) -> anyhow::Result<ServerFrame> {
        let frame = self.recv().await?;
        match frame {
            ServerFrame::Welcome { .. } => Ok(frame),
            other => anyhow::bail!("expected welcome, got {other:?}"),
        }
    }

    /// Read until the server closes. Returns the frames seen on the way.
    pub async fn expect_close(&mut self) -> anyhow::Result<(Closed, Vec<ServerFrame>)> {
        let mut frames = Vec::new();
        loop {
            match timeout(Duration::from_secs(5), self.ws.next()).await? {
                Some(Ok(Message::Text(text))) => frames.push(text.parse()?),
                Some(Ok(Message::Close(Some(frame)))) => {
                    return Ok((Closed::Code(u16::from(frame.code)), frames));
                }
                Some(Ok(Message::Close(None))) | None | Some(Err(_)) => {
                    return Ok((Closed::Dropped, frames));
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Answer heartbeat pings until `dur` elapses, collecting other frames.
    #[allow(dead_code)]
    pub async fn pong_for(&mut self, dur: Duration) -> anyhow::Result<Vec<ServerFrame>> {
        let deadline = tokio::time::Instant::now() + dur;
        let mut frames = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(frames);
            }
            match self.recv_timeout(remaining).await {
                Ok(ServerFrame::Ping { nonce }) => self.send(&ClientFrame::Pong { nonce }).await?,
                Ok(other) => frames.push(other),
                Err(e) if e.is::<tokio::time::error::Elapsed>() => return Ok(frames),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
