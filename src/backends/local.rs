//! In-process limiter. Buckets are never evicted.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::rate_limiter::Limiter;
use crate::token_bucket::{truncate, BucketState};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A bucket plus the rate and burst currently applied to it.
#[derive(Debug)]
struct LocalBucket {
    state: BucketState,
    rate: f64,
    burst: u32,
}

impl LocalBucket {
    fn new(rate: f64, burst: u32, now: Duration) -> Self {
        Self {
            state: BucketState::new(burst as f64, now),
            rate,
            burst,
        }
    }

    /// Switch to a new rate/burst from `now` on. Past intervals keep the old rate.
    fn reconfigure(&mut self, now: Duration, interval: Duration, rate: f64, burst: u32) {
        self.state.settle(now, interval, self.rate, self.burst);
        self.state.cap(burst);
        self.rate = rate;
        self.burst = burst;
    }
}

type Buckets = RwLock<HashMap<String, Arc<Mutex<LocalBucket>>>>;

/// Token bucket limiter keeping every key's bucket in memory.
pub struct MemoryLimiter<C = SystemClock> {
    rate: f64,
    burst: u32,
    interval: Duration,
    clock: C,
    buckets: Buckets,
}

impl MemoryLimiter {
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> MemoryLimiter<C> {
    pub fn with_clock(config: &Config, clock: C) -> Self {
        Self {
            rate: config.rate,
            burst: config.burst,
            interval: config.effective_interval(),
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn now(&self) -> Duration {
        truncate(self.clock.now(), self.interval)
    }

    /// Find the bucket for `key`, creating it full on first access.
    fn bucket(&self, key: &str, rate: f64, burst: u32, now: Duration) -> Arc<Mutex<LocalBucket>> {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }

        // Another caller may have created it between the two locks.
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key, rate, burst, "Creating local bucket");
            Arc::new(Mutex::new(LocalBucket::new(rate, burst, now)))
        });
        Arc::clone(bucket)
    }

    fn check(&self, key: &str, n: u32, rate: f64, burst: u32) -> bool {
        let bucket = self.bucket(key, rate, burst, self.now());
        let mut bucket = bucket.lock();

        // Read under the key's lock so a bucket never moves back in time.
        let now = self.now().max(bucket.state.last_refill);

        if bucket.rate != rate || bucket.burst != burst {
            debug!(
                key,
                old_rate = bucket.rate,
                old_burst = bucket.burst,
                rate,
                burst,
                "Updating local bucket limits"
            );
            bucket.reconfigure(now, self.interval, rate, burst);
        }

        match bucket.state.try_consume(now, self.interval, rate, burst, n) {
            Some(next) => {
                bucket.state = next;
                trace!(key, n, tokens = next.tokens, "Admitted");
                true
            }
            None => {
                trace!(key, n, tokens = bucket.state.tokens, "Rejected");
                false
            }
        }
    }
}

#[async_trait]
impl<C: Clock> Limiter for MemoryLimiter<C> {
    async fn allow_n(&self, key: &str, n: u32) -> bool {
        self.check(key, n, self.rate, self.burst)
    }

    async fn allow_n_dynamic(&self, key: &str, n: u32, rate: f64, burst: u32) -> bool {
        self.check(key, n, rate, burst)
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn burst(&self) -> u32 {
        self.burst
    }
}
