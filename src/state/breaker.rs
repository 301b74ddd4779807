//! Circuit breakers for delivery.
//!
//! Two scopes share one implementation: a per-user breaker gates `flush`,
//! and a per-connection breaker tears down a connection whose sends keep
//! failing. Breakers are keyed by string in a [`BreakerRegistry`].

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::telemetry::{Event, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are refused until the reset timeout elapses.
    Open,
    /// A limited number of probe calls are let through.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            config.reset_timeout(),
            config.half_open_max_calls,
        )
    }

    /// Current state, applying the Open → HalfOpen transition if due.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.state
    }

    fn advance(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= self.reset_timeout)
        {
            inner.state = BreakerState::HalfOpen;
            inner.half_open_in_flight = 0;
        }
    }

    /// Ask permission for one call.
    ///
    /// Every `true` must be followed by `record_success` or `record_failure`.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
        inner.state = BreakerState::Closed;
    }

    /// Give back a permit from `allow` whose call was never made.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a failed call and return the resulting state.
    pub fn record_failure(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                self.trip(&mut inner)
            }
            _ => {}
        }
        inner.state
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = 0;
    }

    /// Time until an open breaker half-opens. `None` unless open.
    pub fn retry_after(&self) -> Option<Duration> {
        let mut inner = self.inner.lock();
        self.advance(&mut inner);
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => Some(self.reset_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

/// Keyed breakers (`user:{id}` / `conn:{id}`).
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    telemetry: Arc<Telemetry>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            telemetry,
        }
    }

    pub fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }

    pub fn connection_key(connection_id: &str) -> String {
        format!("conn:{connection_id}")
    }

    /// Breaker for `key`, created closed on first use.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.get(key) {
            return b.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(&self.config)))
            .clone()
    }

    /// Record a failure on `key`, counting a trip when the breaker opens.
    pub fn record_failure(&self, key: &str) -> BreakerState {
        let breaker = self.get(key);
        let before = breaker.state();
        let after = breaker.record_failure();
        if after == BreakerState::Open && before != BreakerState::Open {
            self.telemetry.record(Event::BreakerTripped);
            warn!(breaker = %key, failures = breaker.consecutive_failures(), "circuit breaker opened");
        }
        after
    }

    pub fn record_success(&self, key: &str) {
        if let Some(breaker) = self.breakers.get(key).map(|b| b.clone()) {
            if breaker.state() != BreakerState::Closed {
                info!(breaker = %key, "circuit breaker closed");
            }
            breaker.record_success();
        }
    }

    pub fn remove(&self, key: &str) {
        self.breakers.remove(key);
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.value().state() != BreakerState::Closed)
            .count()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn trips_after_threshold_and_half_opens() {
        let b = CircuitBreaker::new(3, Duration::from_secs(10), 1);
        assert!(b.allow());
        assert_eq!(b.record_failure(), BreakerState::Closed);
        assert_eq!(b.record_failure(), BreakerState::Closed);
        assert_eq!(b.record_failure(), BreakerState::Open);
        assert!(!b.allow());
        assert_eq!(b.retry_after(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow());
        assert!(!b.allow(), "only one probe while half-open");

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new(1, Duration::from_secs(5), 1);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.allow());
        assert_eq!(b.record_failure(), BreakerState::Open);
        assert!(!b.allow());
        assert_eq!(b.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new(2, Duration::from_secs(5), 1);
        b.record_failure();
        b.record_success();
        assert_eq!(b.record_failure(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_counts_trips_once() {
        let telemetry = Arc::new(Telemetry::new());
        let config = BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        };
        let reg = BreakerRegistry::new(config, telemetry.clone());
        let key = BreakerRegistry::user_key("alice");

        reg.record_failure(&key);
        reg.record_failure(&key);
        reg.record_failure(&key);
        assert_eq!(telemetry.get(Event::BreakerTripped), 1);
        assert_eq!(reg.open_count(), 1);

        reg.record_success(&key);
        assert_eq!(reg.open_count(), 0);
        reg.remove(&key);
        assert!(reg.is_empty());
    }
}
