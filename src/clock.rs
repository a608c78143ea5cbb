//! Monotonic clock abstraction
//!
//! Timer-driven transitions (circuit recovery, trace age-out, retry delays)
//! go through this trait so tests can drive time deterministically instead of
//! sleeping.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time
pub trait Clock: Send + Sync {
    /// Monotonic instant for elapsed-time comparisons
    fn now(&self) -> Instant;

    /// Wall-clock timestamp for event and record stamping
    fn wall(&self) -> DateTime<Utc>;
}

/// Production clock backed by the OS
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced manually
///
/// `now()` returns a fixed base instant plus an offset that only moves when
/// `advance` is called.
pub struct ManualClock {
    base: Instant,
    wall_base: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall_base: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().unwrap();
        self.wall_base + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(61));
        let t1 = clock.now();
        assert_eq!(t1.duration_since(t0), Duration::from_secs(61));
    }

    #[test]
    fn test_manual_clock_stands_still() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), t0);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
