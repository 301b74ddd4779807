//! Integration test common infrastructure.
//!
//! Spawns an in-process gateway on an ephemeral port and drives it with
//! real WebSocket clients.

pub mod client;
pub mod server;

#[allow(unused_imports)]
pub use client::TestClient;
#[allow(unused_imports)]
pub use server::TestServer;

use std::time::Duration;

/// Poll `check` until it holds or `within` elapses.
#[allow(dead_code)]
pub async fn eventually<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
