//! Test server management.
//!
//! Runs a hub and gateway inside the test process so tests can inspect
//! server state directly.

use pulsed::config::Config;
use pulsed::network::Gateway;
use pulsed::state::Hub;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::client::TestClient;

/// Tokens accepted by every test server.
pub const ALICE: &str = "tok-alice";
#[allow(dead_code)]
pub const BOB: &str = "tok-bob";

/// A test server instance.
pub struct TestServer {
    pub hub: Arc<Hub>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Spawn a server with test defaults.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with(|_| {}).await
    }

    /// Spawn a server, letting the test adjust the config first.
    pub async fn spawn_with(adjust: impl FnOnce(&mut Config)) -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.listen.address = "127.0.0.1:0".parse()?;
        config.listen.handshake_timeout_ms = 1_000;
        config.limits.connection_rate_per_second = 1_000;
        config.limits.connection_burst_per_ip = 1_000;
        config.session.offline_debounce_ms = 0;
        config.auth.tokens = HashMap::from([
            (ALICE.to_string(), "alice".to_string()),
            (BOB.to_string(), "bob".to_string()),
        ]);
        adjust(&mut config);

        let hub = Hub::in_memory(config)?;
        let gateway = Gateway::bind(hub.config.listen.address, Arc::clone(&hub)).await?;
        let addr = gateway.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = gateway.run().await;
        });

        Ok(Self { hub, addr, task })
    }

    /// Get the server address.
    #[allow(dead_code)]
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL carrying `token` as a query parameter.
    pub fn url_with_token(&self, token: &str) -> String {
        format!("ws://{}/?token={}", self.addr, token)
    }

    /// WebSocket URL without a token.
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Connect with `token` and consume the welcome frame.
    pub async fn connect(&self, token: &str) -> anyhow::Result<TestClient> {
        let mut client = TestClient::connect(&self.url_with_token(token)).await?;
        client.expect_welcome().await?;
        Ok(client)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.hub.shutdown();
        self.task.abort();
    }
}
