//! Gateway - TCP listener that accepts incoming WebSocket clients.
//!
//! The Gateway binds one socket and spawns a connection task for each
//! client that passes the per-IP admission limiter.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

use super::connection;
use super::limit::AdmissionLimiter;
use crate::error::AdmissionError;
use crate::metrics;
use crate::state::Hub;
use crate::telemetry::Event;

/// The Gateway accepts incoming TCP connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    hub: Arc<Hub>,
    limiter: AdmissionLimiter,
}

impl Gateway {
    /// Bind the gateway to `addr`. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let limiter = AdmissionLimiter::new(&hub.config.limits);
        info!(address = %listener.local_addr()?, "WebSocket listener bound");
        Ok(Self {
            listener,
            hub,
            limiter,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the hub's shutdown token is cancelled.
    ///
    /// Open connections are children of that token and close themselves
    /// with `1001 Going Away`.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = self.hub.shutdown_token().clone();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested - gateway stopped accepting");
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    // Check connection rate limit before upgrading
                    if !self.limiter.check_connection_rate(addr.ip()) {
                        warn!(%addr, "connection rate limit exceeded - rejecting");
                        self.hub.telemetry.record(Event::AdmissionRejected);
                        metrics::record_admission_rejected(
                            AdmissionError::RateLimited.error_code(),
                        );
                        drop(stream);
                        continue;
                    }

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    debug!(%addr, "connection accepted");

                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = connection::serve(stream, addr, hub).await {
                            debug!(%addr, error = %e, code = e.error_code(), "connection not admitted");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }

        Ok(())
    }
}
