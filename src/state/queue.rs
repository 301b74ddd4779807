//! Message Delivery Queue.
//!
//! One bounded FIFO per user. Messages get a per-user sequence number (first
//! is 1) and move through
//!
//! ```text
//! Pending -> Sending -> Delivered
//!               |
//!               +-> Failed -> (due) -> Sending ...
//!               +-> Expired (attempt budget exhausted)
//! Pending/Failed -> Expired (overflow eviction, session cancel)
//! ```
//!
//! `flush` is serialized per user and walks the queue head first. An
//! attempt fans the head message out to every open connection of the user
//! concurrently; the first acceptance marks it Delivered. A Failed head that
//! is not yet due blocks everything behind it, which is what keeps per-user
//! order intact across retries.
//!
//! Recently delivered frames are kept in a small replay ring so a client that
//! reconnects with `resume { after_seq }` can catch up on one connection.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use pulse_proto::{CloseCode, encode_event};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use super::breaker::{BreakerRegistry, BreakerState};
use super::connection::{Connection, ConnectionId};
use super::dashmap_ext::DashMapExt;
use super::reconnect::ReconnectPolicy;
use super::registry::{ConnectionObserver, ConnectionRegistry};
use crate::config::MIN_QUEUE_CAPACITY;
use crate::metrics;
use crate::telemetry::{Event, SendTimer, Telemetry, spans};
use crate::transport::SendError;

/// Terminal outcomes remembered per user for `status` lookups.
const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sending,
    Delivered,
    Failed,
    Expired,
}

/// Why a message was expired without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Overflow,
    AttemptsExhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: u64,
    pub user_id: String,
    pub payload: Bytes,
    pub state: MessageState,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest retry time of a Failed message.
    pub next_attempt_at: Option<Instant>,
}

/// Called exactly once for every message that expires.
pub type OnExpired = Arc<dyn Fn(&QueuedMessage, ExpiryReason) + Send + Sync>;

/// Why a flush stopped before draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushHalt {
    /// The user has no open connection; messages stay Pending.
    NoConnection,
    /// The user's breaker is open; a flush is scheduled after the delay.
    BreakerOpen(Duration),
    /// The head message failed and is waiting for its retry.
    RetryPending(Duration),
    /// The session was cancelled while an attempt was in flight.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub expired: usize,
    /// Messages still queued after the flush.
    pub remaining: usize,
    pub halted: Option<FlushHalt>,
}

#[derive(Debug)]
struct UserQueue {
    next_seq: u64,
    messages: VecDeque<QueuedMessage>,
    replay: VecDeque<(u64, Bytes)>,
    history: VecDeque<(u64, MessageState)>,
    retry_at: Option<Instant>,
    /// Bumped by `cancel_user`; in-flight results from an older generation
    /// are discarded.
    generation: u64,
    /// Last enqueue or settled attempt. Drives idle pruning.
    touched: Instant,
}

impl UserQueue {
    fn new() -> Self {
        Self {
            next_seq: 1,
            messages: VecDeque::new(),
            replay: VecDeque::new(),
            history: VecDeque::new(),
            retry_at: None,
            generation: 0,
            touched: Instant::now(),
        }
    }

    fn remember(&mut self, id: u64, state: MessageState) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((id, state));
    }
}

struct UserSlot {
    state: parking_lot::Mutex<UserQueue>,
    flush: tokio::sync::Mutex<()>,
}

impl UserSlot {
    fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(UserQueue::new()),
            flush: tokio::sync::Mutex::new(()),
        }
    }
}

/// Head message picked for an attempt.
struct Attempt {
    id: u64,
    frame: Bytes,
    generation: u64,
}

/// How an attempt ended, decided under the queue lock.
enum Settled {
    Delivered,
    Retry(Instant),
    Exhausted(QueuedMessage),
    Discarded,
}

type SendFuture = BoxFuture<'static, (Arc<Connection>, Result<(), SendError>)>;

pub struct DeliveryQueue {
    queues: DashMap<String, Arc<UserSlot>>,
    registry: Arc<ConnectionRegistry>,
    breakers: Arc<BreakerRegistry>,
    policy: ReconnectPolicy,
    capacity: usize,
    replay_window: usize,
    telemetry: Arc<Telemetry>,
    on_expired: RwLock<Option<OnExpired>>,
    me: Weak<DeliveryQueue>,
}

impl DeliveryQueue {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        breakers: Arc<BreakerRegistry>,
        policy: ReconnectPolicy,
        capacity: usize,
        replay_window: usize,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            queues: DashMap::new(),
            registry,
            breakers,
            policy,
            capacity: capacity.max(MIN_QUEUE_CAPACITY),
            replay_window,
            telemetry,
            on_expired: RwLock::new(None),
            me: me.clone(),
        })
    }

    pub fn set_on_expired(&self, callback: OnExpired) {
        *self.on_expired.write() = Some(callback);
    }

    fn slot(&self, user_id: &str) -> Arc<UserSlot> {
        if let Some(slot) = self.queues.get_cloned(user_id) {
            return slot;
        }
        self.queues
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(UserSlot::new()))
            .clone()
    }

    fn report_expired(&self, expired: &[(QueuedMessage, ExpiryReason)]) {
        if expired.is_empty() {
            return;
        }
        metrics::adjust_gauge(&metrics::QUEUE_DEPTH, -(expired.len() as i64));
        let callback = self.on_expired.read().clone();
        for (msg, reason) in expired {
            self.telemetry.record(Event::MessageExpired);
            if *reason == ExpiryReason::Overflow {
                self.telemetry.record(Event::QueueOverflow);
            }
            if let Some(cb) = &callback {
                cb(msg, *reason);
            }
        }
    }

    /// Append a message for `user_id` and return its sequence number.
    ///
    /// Never fails. At capacity the oldest message that is not currently
    /// being sent is expired to make room. At most one message (the head)
    /// is ever Sending, so a capacity of at least two always finds a victim.
    pub fn enqueue(&self, user_id: &str, payload: Bytes) -> u64 {
        let slot = self.slot(user_id);
        let (id, evicted) = {
            let mut q = slot.state.lock();
            let id = q.next_seq;
            q.next_seq += 1;
            q.touched = Instant::now();

            let mut evicted = None;
            if q.messages.len() >= self.capacity
                && let Some(pos) = q
                    .messages
                    .iter()
                    .position(|m| m.state != MessageState::Sending)
                && let Some(mut old) = q.messages.remove(pos)
            {
                old.state = MessageState::Expired;
                q.remember(old.id, MessageState::Expired);
                evicted = Some(old);
            }

            q.messages.push_back(QueuedMessage {
                id,
                user_id: user_id.to_string(),
                payload,
                state: MessageState::Pending,
                attempt_count: 0,
                enqueued_at: Utc::now(),
                last_attempt_at: None,
                next_attempt_at: None,
            });
            (id, evicted)
        };

        metrics::adjust_gauge(&metrics::QUEUE_DEPTH, 1);
        self.telemetry.record(Event::MessageEnqueued);
        if let Some(old) = evicted {
            warn!(user_id = %user_id, message_id = old.id, capacity = self.capacity, "queue full, expired oldest message");
            self.report_expired(&[(old, ExpiryReason::Overflow)]);
        }
        id
    }

    /// Deliver queued messages for `user_id` in sequence order.
    pub async fn flush(&self, user_id: &str) -> FlushOutcome {
        let Some(slot) = self.queues.get_cloned(user_id) else {
            return FlushOutcome::default();
        };
        self.flush_slot(user_id, slot)
            .instrument(spans::flush(user_id))
            .await
    }

    async fn flush_slot(&self, user_id: &str, slot: Arc<UserSlot>) -> FlushOutcome {
        let _serialized = slot.flush.lock().await;
        let user_key = BreakerRegistry::user_key(user_id);
        let user_breaker = self.breakers.get(&user_key);
        let mut outcome = FlushOutcome::default();

        loop {
            let now = Instant::now();

            let blocked_until = {
                let q = slot.state.lock();
                let Some(head) = q.messages.front() else {
                    break;
                };
                match (head.state, head.next_attempt_at) {
                    (MessageState::Failed, Some(due)) if due > now => Some(due),
                    _ => None,
                }
            };
            if let Some(due) = blocked_until {
                outcome.halted = Some(FlushHalt::RetryPending(due - now));
                self.schedule_retry(user_id, &slot, due);
                break;
            }

            let conns = self.registry.list_open_by_user(user_id);
            if conns.is_empty() {
                outcome.halted = Some(FlushHalt::NoConnection);
                break;
            }

            if !user_breaker.allow() {
                let wait = user_breaker.retry_after().unwrap_or(Duration::ZERO);
                outcome.halted = Some(FlushHalt::BreakerOpen(wait));
                self.schedule_retry(user_id, &slot, now + wait);
                break;
            }

            let Some(attempt) = Self::begin_attempt(&slot) else {
                user_breaker.release();
                break;
            };

            let result = {
                let _timer = SendTimer::start();
                self.fan_out(conns, attempt.frame.clone()).await
            };

            match self.settle(user_id, &slot, &attempt, result) {
                Settled::Delivered => {
                    self.breakers.record_success(&user_key);
                    self.telemetry.record(Event::MessageDelivered);
                    metrics::adjust_gauge(&metrics::QUEUE_DEPTH, -1);
                    outcome.delivered += 1;
                }
                Settled::Exhausted(msg) => {
                    self.breakers.record_failure(&user_key);
                    self.telemetry.record(Event::DeliveryFailed);
                    self.report_expired(&[(msg, ExpiryReason::AttemptsExhausted)]);
                    outcome.expired += 1;
                }
                Settled::Retry(due) => {
                    self.breakers.record_failure(&user_key);
                    self.telemetry.record(Event::DeliveryFailed);
                    outcome.failed += 1;
                    outcome.halted = Some(FlushHalt::RetryPending(
                        due.saturating_duration_since(Instant::now()),
                    ));
                    self.schedule_retry(user_id, &slot, due);
                    break;
                }
                Settled::Discarded => {
                    user_breaker.release();
                    outcome.halted = Some(FlushHalt::Cancelled);
                    break;
                }
            }
        }

        outcome.remaining = slot.state.lock().messages.len();
        outcome
    }

    /// Apply the result of an attempt to the head message.
    fn settle(
        &self,
        user_id: &str,
        slot: &UserSlot,
        attempt: &Attempt,
        result: Result<ConnectionId, SendError>,
    ) -> Settled {
        let mut q = slot.state.lock();
        q.touched = Instant::now();
        if q.generation != attempt.generation
            || q.messages.front().map(|m| m.id) != Some(attempt.id)
        {
            debug!(user_id = %user_id, message_id = attempt.id, "session cancelled, discarding send result");
            return Settled::Discarded;
        }

        match result {
            Ok(conn_id) => {
                if let Some(mut msg) = q.messages.pop_front() {
                    msg.state = MessageState::Delivered;
                    q.remember(msg.id, MessageState::Delivered);
                    if self.replay_window > 0 {
                        if q.replay.len() == self.replay_window {
                            q.replay.pop_front();
                        }
                        q.replay.push_back((msg.id, attempt.frame.clone()));
                    }
                    debug!(user_id = %user_id, message_id = msg.id, connection_id = %conn_id, "delivered");
                }
                Settled::Delivered
            }
            Err(err) => {
                let attempts = q.messages.front().map_or(0, |m| m.attempt_count);
                if attempts >= self.policy.max_attempts() {
                    let Some(mut msg) = q.messages.pop_front() else {
                        return Settled::Discarded;
                    };
                    msg.state = MessageState::Expired;
                    q.remember(msg.id, MessageState::Expired);
                    info!(user_id = %user_id, message_id = msg.id, attempts, error = %err, "delivery attempts exhausted");
                    return Settled::Exhausted(msg);
                }

                let delay = self.policy.next_delay(attempts.saturating_sub(1));
                let due = Instant::now() + delay;
                if let Some(head) = q.messages.front_mut() {
                    head.state = MessageState::Failed;
                    head.next_attempt_at = Some(due);
                }
                debug!(
                    user_id = %user_id,
                    message_id = attempt.id,
                    attempt = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "delivery failed"
                );
                Settled::Retry(due)
            }
        }
    }

    /// Mark the head Sending and count the attempt.
    fn begin_attempt(slot: &UserSlot) -> Option<Attempt> {
        let mut q = slot.state.lock();
        let generation = q.generation;
        let head = q.messages.front_mut()?;
        head.state = MessageState::Sending;
        head.attempt_count += 1;
        head.last_attempt_at = Some(Utc::now());
        head.next_attempt_at = None;
        Some(Attempt {
            id: head.id,
            frame: Bytes::from(encode_event(head.id, &head.payload)),
            generation,
        })
    }

    /// Send `frame` to every connection concurrently. Resolves on the first
    /// acceptance; stragglers finish in the background and only feed their
    /// connection breakers.
    async fn fan_out(
        &self,
        conns: Vec<Arc<Connection>>,
        frame: Bytes,
    ) -> Result<ConnectionId, SendError> {
        let mut sends: FuturesUnordered<SendFuture> = conns
            .into_iter()
            .map(|conn| {
                let frame = frame.clone();
                async move {
                    let result = conn.send(frame).await;
                    (conn, result)
                }
                .boxed()
            })
            .collect();

        let mut last_err = SendError::Closed;
        while let Some((conn, result)) = sends.next().await {
            match result {
                Ok(()) => {
                    self.connection_result(&conn, &Ok(()));
                    if !sends.is_empty() {
                        let me = self.me.clone();
                        tokio::spawn(async move {
                            while let Some((conn, result)) = sends.next().await {
                                if let Some(queue) = me.upgrade() {
                                    queue.connection_result(&conn, &result);
                                }
                            }
                        });
                    }
                    return Ok(conn.id().clone());
                }
                Err(err) => {
                    self.connection_result(&conn, &Err(err.clone()));
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn connection_result(&self, conn: &Arc<Connection>, result: &Result<(), SendError>) {
        let key = BreakerRegistry::connection_key(conn.id().as_str());
        match result {
            Ok(()) => self.breakers.record_success(&key),
            Err(err) => {
                if self.breakers.record_failure(&key) == BreakerState::Open {
                    warn!(connection_id = %conn.id(), user_id = %conn.user_id(), error = %err, "connection breaker open, closing");
                    conn.shutdown(CloseCode::BREAKER_OPEN);
                }
            }
        }
    }

    fn schedule_retry(&self, user_id: &str, slot: &Arc<UserSlot>, due: Instant) {
        {
            let mut q = slot.state.lock();
            if q.retry_at.is_some_and(|at| at <= due) {
                return;
            }
            q.retry_at = Some(due);
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let me = self.me.clone();
        let slot = Arc::downgrade(slot);
        let user_id = user_id.to_string();
        handle.spawn(async move {
            tokio::time::sleep_until(due).await;
            let (Some(queue), Some(slot)) = (me.upgrade(), slot.upgrade()) else {
                return;
            };
            {
                let mut q = slot.state.lock();
                if q.retry_at != Some(due) {
                    return;
                }
                q.retry_at = None;
            }
            queue.flush(&user_id).await;
        });
    }

    /// Resend delivered frames newer than `after_seq` to one connection.
    ///
    /// Returns how many frames were written.
    pub async fn replay(&self, user_id: &str, after_seq: u64, conn: &Connection) -> usize {
        let Some(slot) = self.queues.get_cloned(user_id) else {
            return 0;
        };
        let frames: Vec<(u64, Bytes)> = slot
            .state
            .lock()
            .replay
            .iter()
            .filter(|(seq, _)| *seq > after_seq)
            .cloned()
            .collect();

        let mut sent = 0;
        for (seq, frame) in frames {
            if let Err(err) = conn.send(frame).await {
                debug!(user_id = %user_id, seq, error = %err, "replay interrupted");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Drop everything queued for `user_id`. In-flight results are discarded.
    pub fn cancel_user(&self, user_id: &str) -> usize {
        let Some(slot) = self.queues.get_cloned(user_id) else {
            return 0;
        };
        let expired: Vec<(QueuedMessage, ExpiryReason)> = {
            let mut q = slot.state.lock();
            q.generation = q.generation.wrapping_add(1);
            q.retry_at = None;
            let drained: Vec<QueuedMessage> = q.messages.drain(..).collect();
            drained
                .into_iter()
                .map(|mut msg| {
                    msg.state = MessageState::Expired;
                    q.remember(msg.id, MessageState::Expired);
                    (msg, ExpiryReason::Cancelled)
                })
                .collect()
        };
        let count = expired.len();
        if count > 0 {
            info!(user_id = %user_id, dropped = count, "session cancelled, dropped queued messages");
        }
        self.report_expired(&expired);
        count
    }

    /// State of message `id` for `user_id`, if it is still known.
    pub fn status(&self, user_id: &str, id: u64) -> Option<MessageState> {
        let slot = self.queues.get_cloned(user_id)?;
        let q = slot.state.lock();
        q.messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.state)
            .or_else(|| {
                q.history
                    .iter()
                    .rev()
                    .find(|(h, _)| *h == id)
                    .map(|(_, s)| *s)
            })
    }

    /// Copy of the messages still queued for `user_id`, oldest first.
    pub fn snapshot(&self, user_id: &str) -> Vec<QueuedMessage> {
        self.queues
            .get_cloned(user_id)
            .map(|slot| slot.state.lock().messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget users whose queue is empty, who hold no connection and whose
    /// queue saw no activity for `retention`. Their user breaker goes too.
    ///
    /// A slot that any task still holds (enqueue, flush, replay) is kept;
    /// the next sweep gets it. Returns how many users were dropped.
    pub fn prune_idle(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .queues
            .iter()
            .filter(|e| {
                let q = e.value().state.lock();
                q.messages.is_empty() && now.saturating_duration_since(q.touched) >= retention
            })
            .map(|e| e.key().clone())
            .collect();

        let mut pruned = 0;
        for user_id in candidates {
            if !self.registry.list_by_user(&user_id).is_empty() {
                continue;
            }
            let removed = self.queues.remove_if(&user_id, |_, slot| {
                let q = slot.state.lock();
                Arc::strong_count(slot) == 1
                    && q.messages.is_empty()
                    && now.saturating_duration_since(q.touched) >= retention
            });
            if removed.is_some() {
                self.breakers.remove(&BreakerRegistry::user_key(&user_id));
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "idle delivery queues dropped");
        }
        pruned
    }

    /// Users with a queue slot, idle or not.
    pub fn user_count(&self) -> usize {
        self.queues.len()
    }

    pub fn pending_len(&self, user_id: &str) -> usize {
        self.queues
            .get_cloned(user_id)
            .map(|slot| slot.state.lock().messages.len())
            .unwrap_or(0)
    }
}

impl ConnectionObserver for DeliveryQueue {
    fn on_connection_added(&self, _conn: &Arc<Connection>) {}

    fn on_connection_removed(&self, conn: &Arc<Connection>) {
        self.breakers
            .remove(&BreakerRegistry::connection_key(conn.id().as_str()));
    }
}
