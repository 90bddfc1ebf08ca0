//! Long-poll waiters.
//!
//! A waiter is a single-assignment slot registered with the broker while a
//! long-poll request has nothing to return yet. Whoever removes the slot from
//! the broker's waiter set gets to resolve it: a publish, the deadline, a
//! client disconnect or broker shutdown. Removal happens under the broker
//! lock, so the slot is written exactly once.

use std::fmt;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::Broker;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(Uuid);

impl WaiterId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal state of a long poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Message(Message),
    /// The deadline elapsed with no publish.
    Timeout,
    /// The caller went away or the broker shut down.
    Cancelled,
}

impl WaitOutcome {
    pub fn into_message(self) -> Option<Message> {
        match self {
            WaitOutcome::Message(message) => Some(message),
            WaitOutcome::Timeout | WaitOutcome::Cancelled => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WaitOutcome::Message(_) => "message",
            WaitOutcome::Timeout => "timeout",
            WaitOutcome::Cancelled => "cancelled",
        }
    }
}

/// Result of starting a long poll.
pub enum LongPoll {
    /// Resolved without registering a waiter (stored message, zero timeout,
    /// or shutdown).
    Ready(WaitOutcome),
    Pending(PendingWait),
}

/// The broker-side half of a waiter.
pub(crate) struct WaiterSlot {
    tx: oneshot::Sender<WaitOutcome>,
    created_at: Instant,
    deadline: Instant,
}

impl WaiterSlot {
    pub(crate) fn open(created_at: Instant, deadline: Instant) -> (Self, oneshot::Receiver<WaitOutcome>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            tx,
            created_at,
            deadline,
        };
        (slot, rx)
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Consumes the slot, so a second write cannot be expressed.
    pub(crate) fn resolve(self, outcome: WaitOutcome) {
        // Receiver gone means the caller was dropped mid-resolution
        let _ = self.tx.send(outcome);
    }
}

/// A registered long poll. Await it with [`PendingWait::wait`]; dropping it
/// before resolution cancels the waiter.
pub struct PendingWait {
    id: WaiterId,
    deadline: Instant,
    rx: oneshot::Receiver<WaitOutcome>,
    guard: WaiterGuard,
}

impl PendingWait {
    pub(crate) fn new(
        id: WaiterId,
        deadline: Instant,
        rx: oneshot::Receiver<WaitOutcome>,
        broker: Broker,
    ) -> Self {
        Self {
            id,
            deadline,
            rx,
            guard: WaiterGuard { id, broker },
        }
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the waiter resolves or its deadline passes.
    ///
    /// The deadline timer lives inside this future and is dropped with it.
    pub async fn wait(mut self) -> WaitOutcome {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_elapsed) => {
                // Race the deadline against a concurrent publish: if someone
                // else claimed the slot first, their outcome is already in rx.
                self.guard.broker.resolve_waiter(self.id, WaitOutcome::Timeout);
                self.rx.try_recv().unwrap_or(WaitOutcome::Cancelled)
            }
        };
        tracing::debug!(waiter = %self.id, outcome = outcome.kind(), "long poll resolved");
        outcome
    }
}

/// Cancels the waiter when the pending long poll is dropped.
struct WaiterGuard {
    id: WaiterId,
    broker: Broker,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.broker.close_waiter_on_disconnect(self.id);
    }
}
