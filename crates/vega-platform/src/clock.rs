use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic tick counter. One tick is one nanosecond.
///
/// The kernel uses ticks for timeslice accounting and preemption deadlines;
/// it never converts them back to wall-clock time.
pub trait TickSource: Send + Sync {
    fn now_ticks(&self) -> u64;
}

/// Tick source anchored to `Instant` at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced tick source for deterministic tests and timer pumping.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `ticks` and returns the new value.
    pub fn advance(&self, ticks: u64) -> u64 {
        self.ticks.fetch_add(ticks, Ordering::AcqRel) + ticks
    }
}

impl TickSource for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_ticks();
        let b = clock.now_ticks();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_exactly() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ticks(), 0);
        assert_eq!(clock.advance(25), 25);
        clock.advance(5);
        assert_eq!(clock.now_ticks(), 30);
    }
}
