//! Tick sources.
//!
//! The monitor never reads wall time directly; it consumes a [`TickClock`]
//! so hosts can supply their own scheduler clock and tests can drive a
//! virtual one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A monotonically increasing tick counter with a fixed rate.
pub trait TickClock {
    /// Current tick.
    fn now(&self) -> u64;

    /// Ticks per second.
    fn freq(&self) -> u64;
}

/// Default tick rate of [`SystemClock`], in ticks per second.
pub const SYSTEM_TICK_HZ: u64 = 100;

/// Wall-clock tick source counting from its creation instant.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for SystemClock {
    fn now(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_millis() as u64 * SYSTEM_TICK_HZ / 1000
    }

    fn freq(&self) -> u64 {
        SYSTEM_TICK_HZ
    }
}

/// Manually advanced clock. Clones share the same tick counter, so a test
/// can keep one handle while the monitor owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    ticks: Arc<AtomicU64>,
    freq: u64,
}

impl ManualClock {
    pub fn new(freq: u64) -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            freq,
        }
    }

    /// Move the clock forward by `n` ticks.
    pub fn advance(&self, n: u64) {
        self.ticks.fetch_add(n, Ordering::Relaxed);
    }

    /// Jump to an absolute tick. Must not move backwards.
    pub fn set(&self, tick: u64) {
        debug_assert!(tick >= self.ticks.load(Ordering::Relaxed));
        self.ticks.store(tick, Ordering::Relaxed);
    }
}

impl TickClock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn freq(&self) -> u64 {
        self.freq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_shares_ticks_across_clones() {
        let clock = ManualClock::new(100);
        let other = clock.clone();

        clock.advance(7);
        assert_eq!(other.now(), 7);
        other.set(42);
        assert_eq!(clock.now(), 42);
        assert_eq!(clock.freq(), 100);
    }

    #[test]
    fn system_clock_is_monotone() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert_eq!(clock.freq(), SYSTEM_TICK_HZ);
    }
}
