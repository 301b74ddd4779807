//! Prometheus metrics collection for pulsed.
//!
//! Metrics are exposed on the HTTP side-car (`/metrics`). All statics are
//! lazily registered by [`init`]; recording into an uninitialised metric is a
//! no-op so library users and tests do not have to call it.
//!
//! - `pulse_events_total{event}` - Lifecycle events (deliveries, evictions, trips...)
//! - `pulse_connections_open` - Registered connections (gauge)
//! - `pulse_users_online` - Users with presence online or away (gauge)
//! - `pulse_send_duration_seconds` - Fan-out send latency (histogram)
//! - `pulse_heartbeat_rtt_seconds` - Ping round trip (histogram)

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Lifecycle events by name. Mirrors the per-hub `Telemetry` counters.
pub static EVENTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound client frames by type.
pub static FRAMES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Connections refused before registration, by error code.
pub static ADMISSION_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();

/// Connection closes by close code reason.
pub static CONNECTIONS_CLOSED: OnceLock<IntCounterVec> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Currently registered connections.
pub static CONNECTIONS_OPEN: OnceLock<IntGauge> = OnceLock::new();

/// Users currently online or away.
pub static USERS_ONLINE: OnceLock<IntGauge> = OnceLock::new();

/// Messages waiting in delivery queues across all users.
pub static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();

// ========================================================================
// Histograms
// ========================================================================

pub static SEND_LATENCY: OnceLock<Histogram> = OnceLock::new();

pub static HEARTBEAT_RTT: OnceLock<Histogram> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Safe to call more than once; later calls keep the first set of metrics.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            if $metric.get().is_none() {
                match $init {
                    Ok(m) => {
                        if let Err(e) = r.register(Box::new(m.clone())) {
                            tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                        }
                        let _ = $metric.set(m);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                    }
                }
            }
        };
    }

    register!(EVENTS, IntCounterVec::new(Opts::new("pulse_events_total", "Connection and delivery lifecycle events"), &["event"]));
    register!(FRAMES_RECEIVED, IntCounterVec::new(Opts::new("pulse_frames_received_total", "Client frames received by type"), &["type"]));
    register!(ADMISSION_REJECTED, IntCounterVec::new(Opts::new("pulse_admission_rejected_total", "Connections refused before registration"), &["reason"]));
    register!(CONNECTIONS_CLOSED, IntCounterVec::new(Opts::new("pulse_connections_closed_total", "Connection closes by reason"), &["reason"]));
    register!(CONNECTIONS_OPEN, IntGauge::new("pulse_connections_open", "Registered connections"));
    register!(USERS_ONLINE, IntGauge::new("pulse_users_online", "Users online or away"));
    register!(QUEUE_DEPTH, IntGauge::new("pulse_queue_depth", "Messages awaiting delivery"));
    register!(SEND_LATENCY, Histogram::with_opts(
        HistogramOpts::new("pulse_send_duration_seconds", "Fan-out send latency per delivery attempt")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])));
    register!(HEARTBEAT_RTT, Histogram::with_opts(
        HistogramOpts::new("pulse_heartbeat_rtt_seconds", "Application ping round trip")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

#[inline]
pub fn record_event(event: &str) {
    if let Some(c) = EVENTS.get() {
        c.with_label_values(&[event]).inc();
    }
}

#[inline]
pub fn record_frame(kind: &str) {
    if let Some(c) = FRAMES_RECEIVED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

#[inline]
pub fn record_admission_rejected(reason: &str) {
    if let Some(c) = ADMISSION_REJECTED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

#[inline]
pub fn record_close(reason: &str) {
    if let Some(c) = CONNECTIONS_CLOSED.get() {
        c.with_label_values(&[reason]).inc();
    }
}

#[inline]
pub fn adjust_gauge(gauge: &OnceLock<IntGauge>, delta: i64) {
    if let Some(g) = gauge.get() {
        g.add(delta);
    }
}

#[inline]
pub fn observe(histogram: &OnceLock<Histogram>, seconds: f64) {
    if let Some(h) = histogram.get() {
        h.observe(seconds);
    }
}
