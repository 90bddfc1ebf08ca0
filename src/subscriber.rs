//! Persistent subscribers (SSE streams and websocket connections).
//!
//! Each subscriber owns an unbounded FIFO queue filled by `Broker::publish`.
//! The transport side drains it, either directly with [`Subscription::recv`]
//! or by handing a [`Deliver`] sink to [`Subscription::forward`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::Broker;
use crate::message::Message;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("subscriber transport disconnected")]
    Disconnected,

    #[error("transport write failed: {0}")]
    Transport(#[source] BoxError),
}

/// Transport write primitive. Framing (SSE `data:` lines, websocket frames)
/// is the implementor's job.
pub trait Deliver: Send {
    fn deliver(&mut self, message: Message) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Completes when the transport is gone and no further delivery can
    /// succeed. Transports that only learn this from a failed write keep
    /// the default, which never completes.
    fn closed(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

impl Deliver for mpsc::Sender<Message> {
    async fn deliver(&mut self, message: Message) -> Result<(), DeliveryError> {
        self.send(message).await.map_err(|_| DeliveryError::Disconnected)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

/// Why [`Subscription::forward`] returned.
#[derive(Debug)]
pub enum ForwardEnd {
    /// Unsubscribed, replaced, or the broker shut down.
    Closed,
    /// The sink reported its transport gone while idle.
    TransportClosed,
    DeliveryFailed(DeliveryError),
}

/// The broker-side half of a subscriber.
pub(crate) struct SubscriberEntry {
    tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl SubscriberEntry {
    pub(crate) fn open() -> (Self, mpsc::UnboundedReceiver<Message>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let entry = Self {
            tx,
            closed: closed.clone(),
        };
        (entry, rx, closed)
    }

    /// Enqueue a message. Returns false if the receiving half is gone.
    pub(crate) fn offer(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Mark closed. Dropping the entry afterwards drops the sender, which
    /// wakes a pending `recv`.
    pub(crate) fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Handle to an open subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Message>,
    closed: Arc<AtomicBool>,
    broker: Broker,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        rx: mpsc::UnboundedReceiver<Message>,
        closed: Arc<AtomicBool>,
        broker: Broker,
    ) -> Self {
        Self {
            id,
            rx,
            closed,
            broker,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next queued message, in publish order. Returns `None` once closed;
    /// anything still queued at that point is discarded.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        let message = self.rx.recv().await?;
        if self.is_closed() {
            return None;
        }
        Some(message)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn close(&self) {
        self.broker.unsubscribe(self.id);
    }

    /// Drain the queue into `sink` until the subscriber closes, the sink
    /// reports its transport closed, or a delivery fails. The last two close
    /// this subscriber only.
    pub async fn forward<D: Deliver>(mut self, mut sink: D) -> ForwardEnd {
        let mut delivered: u64 = 0;
        loop {
            let next = tokio::select! {
                message = self.recv() => Some(message),
                () = sink.closed() => None,
            };
            let message = match next {
                Some(Some(message)) => message,
                Some(None) => break,
                None => {
                    tracing::debug!(subscriber = %self.id, delivered, "transport closed, closing subscriber");
                    self.close();
                    return ForwardEnd::TransportClosed;
                }
            };
            let seq = message.seq();
            if let Err(error) = sink.deliver(message).await {
                tracing::warn!(subscriber = %self.id, seq, %error, "delivery failed, closing subscriber");
                self.close();
                return ForwardEnd::DeliveryFailed(error);
            }
            delivered += 1;
        }
        tracing::debug!(subscriber = %self.id, delivered, "subscriber closed");
        ForwardEnd::Closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.id);
    }
}
