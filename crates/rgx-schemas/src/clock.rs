//! Injectable time source.
//!
//! Every timed decision in the core (backoff, cooldown, audit timestamps,
//! simulated venue latency) reads time through [`Clock`]. Production wires
//! [`SystemClock`]; tests wire [`FixedClock`] and move time explicitly, so
//! delay sequences and cooldown boundaries are exact.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Time source contract.
pub trait Clock: Send + Sync {
    /// Current time as epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Wait for `d`. The only place a retry delay is ever spent.
    fn sleep(&self, d: Duration);

    /// Current time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Clock handle shared between the orchestrator and its collaborators.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Manually driven clock. `sleep` advances time instead of blocking.
#[derive(Debug, Default)]
pub struct FixedClock {
    now_ms: AtomicI64,
    slept_ms: AtomicI64,
}

impl FixedClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            slept_ms: AtomicI64::new(0),
        }
    }

    /// Convenience: a `FixedClock` already wrapped for sharing.
    pub fn shared(start_ms: i64) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        self.now_ms.fetch_add(duration_ms(d), Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Total time spent in `sleep` since construction.
    pub fn total_slept_ms(&self) -> i64 {
        self.slept_ms.load(Ordering::SeqCst)
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep(&self, d: Duration) {
        let ms = duration_ms(d);
        self.slept_ms.fetch_add(ms, Ordering::SeqCst);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
