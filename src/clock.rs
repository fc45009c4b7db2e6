use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic tick source.
///
/// One tick is one nanosecond. Clocks never go backward; entries are
/// stamped with ticks and function invocations are timed against them.
pub trait Clock: Send + Sync {
    /// Ticks elapsed since the clock was started.
    fn elapsed_ticks(&self) -> u64;

    /// Time elapsed since the clock was started.
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ticks())
    }
}

/// A clock backed by the platform's high-resolution monotonic counter.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a new clock at tick zero.
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn elapsed_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A clock that only moves when told to.
///
/// Lets tests pin entry ages and access stamps to exact values, which makes
/// ranked eviction deterministic.
#[derive(Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Create a clock stopped at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by a number of ticks.
    pub fn advance_ticks(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        self.advance_ticks(duration.as_nanos() as u64);
    }
}

impl Clock for ManualClock {
    fn elapsed_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
