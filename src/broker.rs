//! Pending-response broker shared by the long-poll, SSE and websocket endpoints.
//!
//! The broker keeps the most recently published message, the long-poll
//! waiters blocked until the next publish, and the persistent subscribers
//! that receive every publish. One mutex guards all three; nothing awaits
//! while holding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::clock::{Clock, TokioClock};
use crate::message::Message;
use crate::subscriber::{SubscriberEntry, SubscriberId, Subscription};
use crate::waiter::{LongPoll, PendingWait, WaitOutcome, WaiterId, WaiterSlot};

/// Deadline offset used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{kind} capacity exhausted (limit {limit})")]
    ResourceExhausted { kind: Capacity, limit: usize },

    #[error("broker is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Subscribers,
    Waiters,
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Subscribers => f.write_str("subscriber"),
            Capacity::Waiters => f.write_str("waiter"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Maximum number of open subscribers. `None` means unbounded.
    pub max_subscribers: Option<usize>,
    /// Maximum number of pending long polls. `None` means unbounded.
    pub max_waiters: Option<usize>,
    /// Keep at most one subscriber: each subscribe closes the previous one.
    pub single_subscriber: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub latest_seq: Option<u64>,
    /// Milliseconds since the latest message was published.
    pub latest_age_ms: Option<u64>,
    pub waiters: usize,
    pub subscribers: usize,
    pub shut_down: bool,
}

/// Cloneable handle to shared broker state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    latest: Option<Message>,
    last_seq: u64,
    waiters: HashMap<WaiterId, WaiterSlot>,
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                config,
                clock,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Store `payload` as the latest message, resolve every pending long
    /// poll with it and enqueue it for every open subscriber.
    ///
    /// Never fails. A subscriber whose handle is gone is closed and removed
    /// without affecting delivery to the others.
    pub fn publish(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let now = self.inner.clock.now();

        let mut state = self.inner.state.lock();
        state.last_seq += 1;
        let message = Message::new(state.last_seq, payload, now);

        let waiters = state.waiters.len();
        for (_, slot) in state.waiters.drain() {
            slot.resolve(WaitOutcome::Message(message.clone()));
        }

        let failed: Vec<SubscriberId> = state
            .subscribers
            .iter()
            .filter(|(_, entry)| !entry.offer(message.clone()))
            .map(|(id, _)| *id)
            .collect();
        for id in failed {
            if let Some(entry) = state.subscribers.remove(&id) {
                entry.close();
                tracing::warn!(subscriber = %id, "delivery failed, subscriber closed");
            }
        }
        let subscribers = state.subscribers.len();
        let seq = message.seq();
        state.latest = Some(message);
        drop(state);

        tracing::debug!(seq, waiters, subscribers, "published message");
    }

    /// The most recently published message, if any.
    pub fn latest(&self) -> Option<Message> {
        self.inner.state.lock().latest.clone()
    }

    /// Start a long poll.
    ///
    /// A stored message is returned right away and keeps being returned to
    /// later callers until a newer publish overwrites it. Otherwise a waiter
    /// is registered with deadline `now + timeout`. A zero timeout with no
    /// stored message resolves as [`WaitOutcome::Timeout`] without
    /// registering anything.
    pub fn long_poll(&self, timeout: Duration) -> Result<LongPoll, BrokerError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if let Some(message) = &state.latest {
            return Ok(LongPoll::Ready(WaitOutcome::Message(message.clone())));
        }
        if self.is_shut_down() {
            return Ok(LongPoll::Ready(WaitOutcome::Cancelled));
        }
        if timeout.is_zero() {
            return Ok(LongPoll::Ready(WaitOutcome::Timeout));
        }
        if let Some(limit) = self.inner.config.max_waiters {
            if state.waiters.len() >= limit {
                tracing::warn!(limit, "long poll rejected, waiter capacity exhausted");
                return Err(BrokerError::ResourceExhausted {
                    kind: Capacity::Waiters,
                    limit,
                });
            }
        }

        let id = WaiterId::new();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        let (slot, rx) = WaiterSlot::open(now, deadline);
        state.waiters.insert(id, slot);
        let pending = state.waiters.len();
        drop(state);

        tracing::debug!(waiter = %id, ?timeout, pending, "long poll waiting");
        Ok(LongPoll::Pending(PendingWait::new(id, deadline, rx, self.clone())))
    }

    /// Long poll and wait for the outcome.
    pub async fn await_message(&self, timeout: Duration) -> Result<WaitOutcome, BrokerError> {
        match self.long_poll(timeout)? {
            LongPoll::Ready(outcome) => Ok(outcome),
            LongPoll::Pending(wait) => Ok(wait.wait().await),
        }
    }

    /// Claim a waiter's slot and write `outcome` into it. Returns false if
    /// another party already resolved it.
    pub(crate) fn resolve_waiter(&self, id: WaiterId, outcome: WaitOutcome) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        match state.waiters.remove(&id) {
            Some(slot) => {
                tracing::debug!(
                    waiter = %id,
                    outcome = outcome.kind(),
                    waited = ?now.saturating_duration_since(slot.created_at()),
                    remaining = ?slot.deadline().saturating_duration_since(now),
                    "waiter claimed"
                );
                slot.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve a waiter as cancelled because its caller went away.
    /// Returns false if it had already resolved.
    pub fn close_waiter_on_disconnect(&self, id: WaiterId) -> bool {
        self.resolve_waiter(id, WaitOutcome::Cancelled)
    }

    /// Open a new subscriber.
    pub fn subscribe(&self) -> Result<Subscription, BrokerError> {
        let mut state = self.inner.state.lock();
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }

        if self.inner.config.single_subscriber {
            for (id, entry) in state.subscribers.drain() {
                entry.close();
                tracing::info!(subscriber = %id, "subscriber replaced by a new subscription");
            }
        } else if let Some(limit) = self.inner.config.max_subscribers {
            if state.subscribers.len() >= limit {
                tracing::warn!(limit, "subscribe rejected, subscriber capacity exhausted");
                return Err(BrokerError::ResourceExhausted {
                    kind: Capacity::Subscribers,
                    limit,
                });
            }
        }

        let id = SubscriberId::new();
        let (entry, rx, closed) = SubscriberEntry::open();
        state.subscribers.insert(id, entry);
        let open = state.subscribers.len();
        drop(state);

        tracing::debug!(subscriber = %id, open, "subscriber opened");
        Ok(Subscription::new(id, rx, closed, self.clone()))
    }

    /// Close a subscriber and discard its queue. Returns false if it was
    /// already closed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let entry = self.inner.state.lock().subscribers.remove(&id);
        match entry {
            Some(entry) => {
                entry.close();
                tracing::debug!(subscriber = %id, "subscriber closed");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending long poll, close every subscriber and refuse
    /// new subscriptions. The latest message is kept.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let mut state = self.inner.state.lock();
        let waiters = state.waiters.len();
        for (_, slot) in state.waiters.drain() {
            slot.resolve(WaitOutcome::Cancelled);
        }
        let subscribers = state.subscribers.len();
        for (_, entry) in state.subscribers.drain() {
            entry.close();
        }
        drop(state);

        tracing::info!(waiters, subscribers, "broker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Completes once [`shutdown`](Self::shutdown) has been called.
    pub fn shutdown_signal(&self) -> WaitForCancellationFutureOwned {
        self.inner.shutdown.clone().cancelled_owned()
    }

    pub fn stats(&self) -> BrokerStats {
        let now = self.inner.clock.now();
        let state = self.inner.state.lock();
        BrokerStats {
            latest_seq: state.latest.as_ref().map(Message::seq),
            latest_age_ms: state.latest.as_ref().map(|message| {
                let age = now.saturating_duration_since(message.created_at());
                u64::try_from(age.as_millis()).unwrap_or(u64::MAX)
            }),
            waiters: state.waiters.len(),
            subscribers: state.subscribers.len(),
            shut_down: self.is_shut_down(),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
