//! Token bucket arithmetic shared by the Redis and in-memory backends.
//!
//! Time only advances in whole intervals: `now` is truncated to the interval
//! boundary before anything else happens, and tokens accrue as
//! `elapsed_intervals * rate`, capped at the burst.

use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Round `now` down to the nearest multiple of `interval`.
pub fn truncate(now: Duration, interval: Duration) -> Duration {
    let step = interval.as_nanos();
    if step == 0 {
        return now;
    }
    let nanos = now.as_nanos();
    from_nanos(nanos - nanos % step)
}

/// Whole intervals between `last_refill` and `now`.
///
/// A `last_refill` in the future (clock skew between writers) counts as zero.
pub fn elapsed_intervals(last_refill: Duration, now: Duration, interval: Duration) -> u64 {
    let step = interval.as_nanos().max(1);
    now.checked_sub(last_refill)
        .map(|since| u64::try_from(since.as_nanos() / step).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// Snapshot of one key's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Interval-aligned time of the last successful consumption
    pub last_refill: Duration,
}

impl BucketState {
    pub fn new(tokens: f64, last_refill: Duration) -> Self {
        Self {
            tokens,
            last_refill,
        }
    }

    /// Tokens available at `now`, without mutating the bucket.
    pub fn refilled(&self, now: Duration, interval: Duration, rate: f64, burst: u32) -> f64 {
        let elapsed = elapsed_intervals(self.last_refill, now, interval);
        // NaN and negative rates never replenish.
        let allotment = if elapsed == 0 {
            0.0
        } else {
            elapsed as f64 * rate.max(0.0)
        };
        (self.tokens + allotment).min(burst as f64)
    }

    /// Take `n` tokens at `now`.
    ///
    /// Returns the state to persist on success. On rejection nothing changes,
    /// including the refill computed along the way.
    pub fn try_consume(
        &self,
        now: Duration,
        interval: Duration,
        rate: f64,
        burst: u32,
        n: u32,
    ) -> Option<BucketState> {
        let available = self.refilled(now, interval, rate, burst);
        if available < n as f64 {
            return None;
        }
        Some(BucketState {
            tokens: available - n as f64,
            last_refill: now,
        })
    }

    /// Bank everything accrued up to `now` under the given rate and burst.
    ///
    /// Used before switching a bucket to a new rate or burst so that only
    /// future intervals accrue at the new values.
    pub fn settle(&mut self, now: Duration, interval: Duration, rate: f64, burst: u32) {
        if now > self.last_refill {
            self.tokens = self.refilled(now, interval, rate, burst);
            self.last_refill = now;
        }
    }

    /// Clamp tokens to `burst`.
    pub fn cap(&mut self, burst: u32) {
        self.tokens = self.tokens.min(burst as f64);
    }
}
