//! Millisecond clocks used by every scheduler.
//!
//! Deadlines are absolute millisecond timestamps on a monotonic timeline, so
//! production code uses [`SystemClock`] while tests and simulations drive a
//! [`ManualClock`] forward explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Milliseconds on a scheduler timeline
pub type Millis = u64;

/// Source of "now" for deadline comparisons
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> Millis;
}

/// Monotonic wall clock, counting milliseconds since construction
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

impl Clock for SystemClock {
    #[inline]
    fn now_millis(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

/// Settable clock for deterministic ticking
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new time
    pub fn advance(&self, by: Millis) -> Millis {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}
