use tokio::time::Instant;

/// Monotonic time source used for message timestamps and waiter deadlines.
///
/// Deadlines are awaited with tokio timers, so an implementation must be
/// derived from tokio's clock (for example a fixed offset from it).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads `tokio::time::Instant::now()`, which honours paused test time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
