//! Wall-clock abstraction used by the throttle table and the aggregator.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Thread-safe wall-clock source.
///
/// Production code uses [`SystemClock`]; tests inject a [`ManualClock`] to
/// exercise timing logic without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock whose current time is set explicitly.
///
/// Lives in the library (not behind `cfg(test)`) so integration tests can
/// drive timing-sensitive paths.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(now: SystemTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Manual clock starting at the given number of seconds past the epoch.
    pub fn at_epoch_secs(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    pub fn set(&self, now: SystemTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whole seconds since the Unix epoch. Times before the epoch collapse to 0.
pub fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Microseconds since the Unix epoch.
pub fn epoch_micros(t: SystemTime) -> u64 {
    u64::try_from(t.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros()).unwrap_or(u64::MAX)
}

/// `(seconds, microseconds-within-second)` since the Unix epoch.
pub fn epoch_parts(t: SystemTime) -> (u64, u64) {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_secs(), u64::from(since.subsec_micros()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_epoch_secs(100);
        assert_eq!(epoch_secs(clock.now()), 100);
        clock.advance(Duration::from_millis(1500));
        let (sec, usec) = epoch_parts(clock.now());
        assert_eq!(sec, 101);
        assert_eq!(usec, 500_000);
    }

    #[test]
    fn epoch_parts_splits_subseconds() {
        let t = UNIX_EPOCH + Duration::new(7, 250_000_000);
        assert_eq!(epoch_parts(t), (7, 250_000));
        assert_eq!(epoch_micros(t), 7_250_000);
    }
}
