//! Injectable clock abstraction.
//!
//! Every duration the core waits on (connect timeout, deferred-teardown
//! window, ping timeout, ...) is expressed against this trait rather than
//! called directly against `tokio::time`/`Instant`. Production code drives
//! the core with [`SystemClock`]; tests use [`SimClock`], which advances a
//! logical millisecond counter instantly instead of sleeping in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary but fixed epoch for this clock instance.
    fn now_ms(&self) -> u64;

    /// Suspends the caller for `dur`. One of the cooperative suspension
    /// points the single-writer scheduling model hinges on.
    async fn sleep(&self, dur: Duration);
}

/// Real-time clock backed by `tokio::time`.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Monotonic process-relative clock; callers only ever compare
        // `now_ms()` deltas, never treat it as wall-clock time.
        static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
        let start = *START.get_or_init(std::time::Instant::now);
        start.elapsed().as_millis() as u64
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Deterministic logical clock for tests and simulation harnesses.
///
/// `sleep` advances the counter immediately rather than yielding to a real
/// timer, so a test can drive seconds of simulated time in microseconds of
/// wall time.
#[derive(Debug, Clone)]
pub struct SimClock {
    now_ms: Arc<AtomicU64>,
}

impl Default for SimClock {
    fn default() -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the logical clock by `dur` and returns the new value.
    pub fn advance(&self, dur: Duration) -> u64 {
        self.now_ms.fetch_add(dur.as_millis() as u64, Ordering::SeqCst) + dur.as_millis() as u64
    }
}

#[async_trait]
impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, dur: Duration) {
        self.advance(dur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sim_clock_advances_without_real_delay() {
        let clock = SimClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), 1500);
    }
}
