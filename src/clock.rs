//! Wall-clock sources for the token bucket.
//!
//! Bucket timestamps are shared across processes through Redis, so time is
//! measured against the Unix epoch rather than a process-local origin.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time, as a duration since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Duration;
}

/// Clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Manually driven clock for tests and simulations.
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tollgate::clock::{Clock, ManualClock};
///
/// let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(clock.now(), Duration::from_secs(101));
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(now: Duration) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, delta: Duration) {
        *self.now.lock() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

impl<C: Clock> Clock for Arc<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_epoch() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > Duration::from_secs(1_577_836_800));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(10));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(11_500));

        clock.set(Duration::from_secs(3));
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_shared_manual_clock() {
        let clock = Arc::new(ManualClock::default());
        let handle = Arc::clone(&clock);
        handle.advance(Duration::from_secs(5));
        assert_eq!(Clock::now(&clock), Duration::from_secs(5));
    }
}
