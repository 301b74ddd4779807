//! Heartbeat Monitor - per-connection liveness state machine.
//!
//! ```text
//! Alive --ping sent--> AwaitingPong --pong--> Alive
//!                           |
//!                           +--(pong_timeout elapsed since first unanswered ping)--> Dead
//! ```
//!
//! Pings are sent every `ping_interval` even while a pong is outstanding; a
//! pong for any outstanding nonce revives the connection. A failed ping send
//! is treated exactly like a pong timeout.
//!
//! [`HeartbeatState`] is owned by the connection task and driven by its
//! check timer, so it needs no locking. Time is always passed in so the
//! state machine can be tested without a clock.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::HeartbeatConfig;

/// Outstanding pings remembered for RTT matching.
const MAX_OUTSTANDING: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPhase {
    Alive,
    AwaitingPong,
    Dead,
}

/// What the connection task should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    SendPing(u64),
    Dead,
}

/// Client idleness transitions, fed to the presence manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleChange {
    BecameIdle,
    BecameActive,
}

/// Shared heartbeat parameters.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    away_after: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
            away_after: config.away_after(),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn pong_timeout(&self) -> Duration {
        self.pong_timeout
    }

    /// How often the connection task should call [`HeartbeatState::on_tick`].
    pub fn check_interval(&self) -> Duration {
        (self.ping_interval / 4).max(Duration::from_millis(10))
    }

    /// Fresh state for a connection that just opened at `now`.
    pub fn start(&self, now: Instant) -> HeartbeatState {
        HeartbeatState {
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            away_after: self.away_after,
            phase: HeartbeatPhase::Alive,
            last_ping_at: now,
            awaiting_since: None,
            outstanding: VecDeque::new(),
            next_nonce: 1,
            missed: 0,
            last_client_activity: now,
            idle: false,
        }
    }
}

#[derive(Debug)]
pub struct HeartbeatState {
    ping_interval: Duration,
    pong_timeout: Duration,
    away_after: Option<Duration>,
    phase: HeartbeatPhase,
    last_ping_at: Instant,
    awaiting_since: Option<Instant>,
    outstanding: VecDeque<(u64, Instant)>,
    next_nonce: u64,
    missed: u32,
    last_client_activity: Instant,
    idle: bool,
}

impl HeartbeatState {
    pub fn phase(&self) -> HeartbeatPhase {
        self.phase
    }

    /// Pings sent since the last pong.
    pub fn unanswered(&self) -> u32 {
        self.missed
    }

    pub fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.phase == HeartbeatPhase::Dead {
            return HeartbeatAction::Dead;
        }

        if let Some(since) = self.awaiting_since
            && now.saturating_duration_since(since) >= self.pong_timeout
        {
            self.phase = HeartbeatPhase::Dead;
            return HeartbeatAction::Dead;
        }

        if now.saturating_duration_since(self.last_ping_at) < self.ping_interval {
            return HeartbeatAction::None;
        }

        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.last_ping_at = now;
        self.missed += 1;
        if self.outstanding.len() == MAX_OUTSTANDING {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((nonce, now));
        self.awaiting_since.get_or_insert(now);
        self.phase = HeartbeatPhase::AwaitingPong;
        HeartbeatAction::SendPing(nonce)
    }

    /// Handle a pong. Returns the round-trip time when `nonce` matches an
    /// outstanding ping.
    pub fn on_pong(&mut self, nonce: u64, now: Instant) -> Option<Duration> {
        if self.phase == HeartbeatPhase::Dead {
            return None;
        }
        let sent_at = self
            .outstanding
            .iter()
            .find(|(n, _)| *n == nonce)
            .map(|(_, at)| *at)?;

        self.outstanding.clear();
        self.awaiting_since = None;
        self.missed = 0;
        self.phase = HeartbeatPhase::Alive;
        Some(now.saturating_duration_since(sent_at))
    }

    /// A ping could not be written. Equivalent to a pong timeout.
    pub fn on_send_failure(&mut self) {
        self.phase = HeartbeatPhase::Dead;
    }

    /// Non-heartbeat traffic from the client.
    pub fn on_client_activity(&mut self, now: Instant) -> Option<IdleChange> {
        self.last_client_activity = now;
        if self.idle {
            self.idle = false;
            Some(IdleChange::BecameActive)
        } else {
            None
        }
    }

    /// Check client idleness. Reports the transition once.
    pub fn poll_idle(&mut self, now: Instant) -> Option<IdleChange> {
        let away_after = self.away_after?;
        if !self.idle && now.saturating_duration_since(self.last_client_activity) >= away_after {
            self.idle = true;
            return Some(IdleChange::BecameIdle);
        }
        None
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(ping: u64, pong: u64, away: u64) -> HeartbeatMonitor {
        HeartbeatMonitor::new(&HeartbeatConfig {
            ping_interval_ms: ping,
            pong_timeout_ms: pong,
            away_after_ms: away,
        })
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn pong_revives_and_reports_rtt() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 0).start(t0);

        assert_eq!(hb.on_tick(at(t0, 50)), HeartbeatAction::None);
        assert_eq!(hb.on_tick(at(t0, 100)), HeartbeatAction::SendPing(1));
        assert_eq!(hb.phase(), HeartbeatPhase::AwaitingPong);

        let rtt = hb.on_pong(1, at(t0, 130)).unwrap();
        assert_eq!(rtt, Duration::from_millis(30));
        assert_eq!(hb.phase(), HeartbeatPhase::Alive);
        assert_eq!(hb.unanswered(), 0);
    }

    #[test]
    fn two_missed_pongs_past_timeout_is_dead() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 0).start(t0);

        assert_eq!(hb.on_tick(at(t0, 100)), HeartbeatAction::SendPing(1));
        assert_eq!(hb.on_tick(at(t0, 200)), HeartbeatAction::SendPing(2));
        assert_eq!(hb.unanswered(), 2);
        assert_eq!(hb.on_tick(at(t0, 299)), HeartbeatAction::None);
        assert_eq!(hb.on_tick(at(t0, 300)), HeartbeatAction::Dead);
        assert_eq!(hb.phase(), HeartbeatPhase::Dead);

        // Late pongs do not resurrect a dead connection.
        assert_eq!(hb.on_pong(1, at(t0, 310)), None);
        assert_eq!(hb.on_tick(at(t0, 400)), HeartbeatAction::Dead);
    }

    #[test]
    fn pong_for_older_nonce_still_revives() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 500, 0).start(t0);
        hb.on_tick(at(t0, 100));
        hb.on_tick(at(t0, 200));

        assert_eq!(hb.on_pong(1, at(t0, 250)), Some(Duration::from_millis(150)));
        assert_eq!(hb.phase(), HeartbeatPhase::Alive);
        // The timeout clock restarts with the next ping.
        assert_eq!(hb.on_tick(at(t0, 300)), HeartbeatAction::SendPing(3));
        assert_eq!(hb.on_tick(at(t0, 700)), HeartbeatAction::SendPing(4));
        assert_eq!(hb.on_tick(at(t0, 800)), HeartbeatAction::Dead);
    }

    #[test]
    fn unknown_nonce_is_ignored() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 0).start(t0);
        hb.on_tick(at(t0, 100));
        assert_eq!(hb.on_pong(42, at(t0, 110)), None);
        assert_eq!(hb.phase(), HeartbeatPhase::AwaitingPong);
    }

    #[test]
    fn send_failure_is_fatal() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 0).start(t0);
        hb.on_send_failure();
        assert_eq!(hb.on_tick(at(t0, 1)), HeartbeatAction::Dead);
    }

    #[test]
    fn idle_detection() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 1_000).start(t0);

        assert_eq!(hb.poll_idle(at(t0, 999)), None);
        assert_eq!(hb.poll_idle(at(t0, 1_000)), Some(IdleChange::BecameIdle));
        assert_eq!(hb.poll_idle(at(t0, 1_500)), None);
        assert!(hb.is_idle());

        assert_eq!(
            hb.on_client_activity(at(t0, 1_600)),
            Some(IdleChange::BecameActive)
        );
        assert_eq!(hb.on_client_activity(at(t0, 1_700)), None);
    }

    #[test]
    fn idle_disabled_when_zero() {
        let t0 = Instant::now();
        let mut hb = monitor(100, 200, 0).start(t0);
        assert_eq!(hb.poll_idle(at(t0, 1_000_000)), None);
    }

    #[test]
    fn check_interval_has_floor() {
        assert_eq!(monitor(20, 40, 0).check_interval(), Duration::from_millis(10));
        assert_eq!(
            monitor(25_000, 60_000, 0).check_interval(),
            Duration::from_millis(6_250)
        );
    }
}
