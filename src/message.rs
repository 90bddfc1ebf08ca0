use std::borrow::Cow;

use bytes::Bytes;
use tokio::time::Instant;

/// A published payload. Immutable once created by `Broker::publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    seq: u64,
    payload: Bytes,
    created_at: Instant,
}

impl Message {
    pub(crate) fn new(seq: u64, payload: Bytes, created_at: Instant) -> Self {
        Self {
            seq,
            payload,
            created_at,
        }
    }

    /// Position of this message in publish order, starting at 1.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
