//! Reconnection Policy Engine.
//!
//! Exponential backoff with multiplicative jitter:
//!
//! ```text
//! base(n)  = min(max_delay, initial_delay * multiplier^n)
//! delay(n) = clamp(base(n) * (1 + U(-jitter, +jitter)), 0, max_delay)
//! ```
//!
//! The same function drives three things: the schedule advertised to clients
//! in `welcome`, the advisory sent before a server-initiated close, and
//! per-message delivery retries. Each failure domain keeps its own attempt
//! counter.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_proto::ReconnectAdvice;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ReconnectConfig;
use crate::error::PolicyError;

/// Validated backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: f64,
    max_attempts: u32,
    jitter: f64,
}

impl ReconnectPolicy {
    pub fn new(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        max_attempts: u32,
        jitter: f64,
    ) -> Result<Self, PolicyError> {
        if multiplier.is_nan() || multiplier <= 0.0 {
            return Err(PolicyError::InvalidMultiplier(multiplier));
        }
        if !(0.0..1.0).contains(&jitter) {
            return Err(PolicyError::InvalidJitter(jitter));
        }
        if initial_delay_ms > max_delay_ms {
            return Err(PolicyError::InitialExceedsMax {
                initial: initial_delay_ms,
                max: max_delay_ms,
            });
        }
        Ok(Self {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
            max_attempts,
            jitter,
        })
    }

    pub fn from_config(config: &ReconnectConfig) -> Result<Self, PolicyError> {
        Self::new(
            config.initial_delay_ms,
            config.max_delay_ms,
            config.backoff_multiplier,
            config.max_attempts,
            config.jitter_factor,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic delay for `attempt`, before jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        if capped.is_finite() && capped > 0.0 {
            capped as u64
        } else {
            0
        }
    }

    /// Jittered delay for `attempt` using the supplied RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_ms(attempt) as f64;
        let factor = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        let ms = (base * factor).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }

    /// Jittered delay for `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Whether attempt number `attempt` (zero based) may still be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Schedule advertised to clients.
    pub fn advice(&self) -> ReconnectAdvice {
        ReconnectAdvice {
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_multiplier: self.multiplier,
            max_attempts: self.max_attempts,
            jitter_factor: self.jitter,
        }
    }

    /// Iterator over the retry delays of one retry loop.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Yields one jittered delay per permitted attempt, then ends.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt) {
            return None;
        }
        let delay = self.policy.next_delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

/// One scheduled reconnect, derived from the policy. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectAttempt {
    pub user_id: String,
    /// 1 for the first reconnect after a healthy session.
    pub attempt_number: u32,
    pub next_delay_ms: u64,
    pub started_at: DateTime<Utc>,
    /// The attempt budget is exhausted; the client should show a terminal failure.
    pub give_up: bool,
}

/// Per-user consecutive abnormal-disconnect counters.
///
/// Reset once a new connection of the user completes a heartbeat round trip.
#[derive(Debug)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: DashMap<String, Attempts>,
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last: Instant,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: DashMap::new(),
        }
    }

    /// Record an abnormal disconnect and compute the next reconnect.
    pub fn record_disconnect(&self, user_id: &str) -> ReconnectAttempt {
        let attempt_number = {
            let mut entry = self.attempts.entry(user_id.to_string()).or_insert(Attempts {
                count: 0,
                last: Instant::now(),
            });
            entry.count = entry.count.saturating_add(1);
            entry.last = Instant::now();
            entry.count
        };
        let index = attempt_number - 1;
        let give_up = !self.policy.should_retry(index);
        ReconnectAttempt {
            user_id: user_id.to_string(),
            attempt_number,
            next_delay_ms: if give_up {
                0
            } else {
                self.policy.next_delay(index).as_millis() as u64
            },
            started_at: Utc::now(),
            give_up,
        }
    }

    pub fn reset(&self, user_id: &str) {
        self.attempts.remove(user_id);
    }

    pub fn current(&self, user_id: &str) -> u32 {
        self.attempts.get(user_id).map(|a| a.count).unwrap_or(0)
    }

    /// Forget users whose last disconnect is older than `retention`. A user
    /// that never came back starts over at attempt 1.
    pub fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.attempts.len();
        self.attempts
            .retain(|_, a| now.saturating_duration_since(a.last) < retention);
        before.saturating_sub(self.attempts.len())
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
