//! A monotonic clock trait, injected everywhere the core needs "now".
//!
//! Production code drives the node with [`SystemClock`]; tests drive it with
//! [`ManualClock`] so expiry, token rotation, and search termination can be
//! exercised without sleeping in real time (SPEC_FULL §10.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to. Backed by an offset from a
/// fixed base `Instant` rather than a raw duration, so `now()` keeps
/// returning a real `Instant` that durations and comparisons work on
/// normally.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, dur: Duration) {
        self.offset_ms.fetch_add(dur.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, dur_since_base: Duration) {
        self.offset_ms.store(dur_since_base.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_monotonically() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }
}
