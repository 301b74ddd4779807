//! pulsed - Pulse Daemon
//!
//! Loads the config, builds the hub and runs the WebSocket gateway plus the
//! optional HTTP side-car until Ctrl-C.

use pulsed::auth::StaticTokenAuthenticator;
use pulsed::config::{Config, LogFormat};
use pulsed::network::Gateway;
use pulsed::state::Hub;
use pulsed::telemetry::Telemetry;
use pulsed::{config, http, metrics, store};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.server.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    if let Err(errors) = config::validate(&config) {
        for e in &errors {
            error!(path = %config_path, error = %e, "invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path);
    }

    info!(server = %config.server.name, listen = %config.listen.address, "Starting pulsed");

    metrics::init();

    let telemetry = Arc::new(Telemetry::new());
    let shared_store = store::connect(&config.store, telemetry.clone()).await?;
    info!(backend = shared_store.backend_name(), "shared store ready");

    let auth = Arc::new(StaticTokenAuthenticator::from_config(&config.auth));
    let metrics_port = config.server.metrics_port;
    let listen_addr = config.listen.address;

    let hub = Hub::new(config, auth, shared_store, telemetry)?;

    // The HTTP side-car is optional; unset or 0 disables it.
    match metrics_port {
        Some(port) if port != 0 => {
            let hub = Arc::clone(&hub);
            let shutdown = hub.shutdown_token().clone();
            tokio::spawn(async move {
                http::run_http_server(port, hub, shutdown).await;
            });
        }
        _ => info!("HTTP side-car disabled"),
    }

    {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received - shutting down"),
                Err(e) => warn!(error = %e, "failed to listen for Ctrl-C - shutting down"),
            }
            hub.shutdown();
        });
    }

    let gateway = Gateway::bind(listen_addr, Arc::clone(&hub)).await?;
    gateway.run().await?;

    // Let connection tasks send their close frames.
    let grace = hub.config.limits.send_timeout();
    let deadline = tokio::time::Instant::now() + grace;
    while !hub.registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    info!(remaining = hub.registry.len(), "pulsed stopped");
    Ok(())
}
