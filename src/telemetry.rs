//! Per-hub counters, send timing and span constructors.
//!
//! [`Telemetry`] keeps its own atomics so that several hubs in one process
//! (tests, embedders) observe only their own traffic. Every recorded event is
//! mirrored into the global Prometheus registry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use crate::metrics;

/// Countable lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionEvicted,
    MessageEnqueued,
    MessageDelivered,
    DeliveryFailed,
    MessageExpired,
    QueueOverflow,
    DuplicateSuppressed,
    StateConflict,
    HeartbeatTimeout,
    BreakerTripped,
    AdmissionRejected,
    StoreDegraded,
}

impl Event {
    const ALL: [Event; 14] = [
        Event::ConnectionOpened,
        Event::ConnectionClosed,
        Event::ConnectionEvicted,
        Event::MessageEnqueued,
        Event::MessageDelivered,
        Event::DeliveryFailed,
        Event::MessageExpired,
        Event::QueueOverflow,
        Event::DuplicateSuppressed,
        Event::StateConflict,
        Event::HeartbeatTimeout,
        Event::BreakerTripped,
        Event::AdmissionRejected,
        Event::StoreDegraded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Event::ConnectionOpened => "connection_opened",
            Event::ConnectionClosed => "connection_closed",
            Event::ConnectionEvicted => "connection_evicted",
            Event::MessageEnqueued => "message_enqueued",
            Event::MessageDelivered => "message_delivered",
            Event::DeliveryFailed => "delivery_failed",
            Event::MessageExpired => "message_expired",
            Event::QueueOverflow => "queue_overflow",
            Event::DuplicateSuppressed => "duplicate_suppressed",
            Event::StateConflict => "state_conflict",
            Event::HeartbeatTimeout => "heartbeat_timeout",
            Event::BreakerTripped => "breaker_tripped",
            Event::AdmissionRejected => "admission_rejected",
            Event::StoreDegraded => "store_degraded",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Atomic event counters for one hub.
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: [AtomicU64; Event::ALL.len()],
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record(&self, event: Event) {
        self.counters[event.index()].fetch_add(1, Ordering::Relaxed);
        metrics::record_event(event.as_str());
    }

    pub fn get(&self, event: Event) -> u64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            counters: Event::ALL
                .iter()
                .map(|e| (e.as_str(), self.get(*e)))
                .collect(),
        }
    }
}

/// Point-in-time copy of the counters, served by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub counters: std::collections::BTreeMap<&'static str, u64>,
}

/// Guard for timing a delivery attempt.
///
/// Records send latency when dropped.
pub struct SendTimer {
    start: Instant,
}

impl SendTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Drop for SendTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        metrics::observe(&metrics::SEND_LATENCY, duration);
    }
}

/// Standardized span constructors.
pub mod spans {
    use std::net::SocketAddr;
    use tracing::{Span, info_span};

    /// Create a span for an admitted client connection.
    pub fn connection(connection_id: &str, user_id: &str, addr: SocketAddr) -> Span {
        info_span!("connection", connection_id = %connection_id, user_id = %user_id, addr = %addr)
    }

    /// Create a span for a flush of one user's queue.
    pub fn flush(user_id: &str) -> Span {
        info_span!("flush", user_id = %user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent_per_instance() {
        let a = Telemetry::new();
        let b = Telemetry::new();
        a.record(Event::QueueOverflow);
        a.record(Event::QueueOverflow);
        b.record(Event::MessageDelivered);

        assert_eq!(a.get(Event::QueueOverflow), 2);
        assert_eq!(b.get(Event::QueueOverflow), 0);
        assert_eq!(a.snapshot().counters["queue_overflow"], 2);
        assert_eq!(b.snapshot().counters["message_delivered"], 1);
    }

    #[test]
    fn every_event_has_a_slot() {
        for (i, e) in Event::ALL.iter().enumerate() {
            assert_eq!(e.index(), i);
        }
    }
}
