//! Redis-backed limiter shared by every process pointing at the same store.
//!
//! The read and the write-back are separate round-trips with no
//! compare-and-set in between, so concurrent callers on one key can both
//! spend the same tokens. Admission stays approximate under contention.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{LimiterError, Result};
use crate::rate_limiter::Limiter;
use crate::redis_pool::{ConnectionProvider, RedisPool, StoreConnection};
use crate::token_bucket::{truncate, BucketState};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Token bucket limiter whose buckets live in Redis lists.
pub struct RedisLimiter<P = RedisPool, C = SystemClock> {
    rate: f64,
    burst: u32,
    interval: Duration,
    fail_open: bool,
    provider: P,
    clock: C,
}

impl RedisLimiter {
    /// Build a limiter with its own connection pool.
    pub fn new(config: &Config) -> Result<Self> {
        let pool = RedisPool::new(
            &config.redis_connection_url(),
            config.max_idle_connections,
        )?;
        Ok(Self::with_provider(config, pool, SystemClock))
    }
}

impl<P: ConnectionProvider, C: Clock> RedisLimiter<P, C> {
    pub fn with_provider(config: &Config, provider: P, clock: C) -> Self {
        Self {
            rate: config.rate,
            burst: config.burst,
            interval: config.effective_interval(),
            fail_open: config.fail_open,
            provider,
            clock,
        }
    }

    async fn try_allow(&self, key: &str, n: u32, rate: f64, burst: u32) -> Result<bool> {
        let mut conn = self.provider.get().await?;

        let record = conn.read_bucket(key).await?;
        let now = truncate(self.clock.now(), self.interval);

        // First touch costs exactly one token whatever `n` is.
        if record.is_empty() {
            let tokens = (burst as f64 - 1.0).max(0.0);
            conn.init_bucket(key, tokens, unix_secs(now)).await?;
            debug!(key, tokens, burst, "Initialized bucket");
            return Ok(true);
        }

        let bucket = decode_bucket(key, &record, self.interval)?;
        let Some(next) = bucket.try_consume(now, self.interval, rate, burst, n) else {
            trace!(key, n, tokens = bucket.tokens, "Rejected");
            return Ok(false);
        };

        conn.write_bucket(key, next.tokens, unix_secs(next.last_refill))
            .await?;
        trace!(key, n, tokens = next.tokens, "Admitted");
        Ok(true)
    }
}

#[async_trait]
impl<P: ConnectionProvider, C: Clock> Limiter for RedisLimiter<P, C> {
    async fn allow_n(&self, key: &str, n: u32) -> bool {
        self.allow_n_dynamic(key, n, self.rate, self.burst).await
    }

    async fn allow_n_dynamic(&self, key: &str, n: u32, rate: f64, burst: u32) -> bool {
        match self.try_allow(key, n, rate, burst).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(key, error = %e, fail_open = self.fail_open, "Redis rate limit check failed");
                self.fail_open
            }
        }
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn burst(&self) -> u32 {
        self.burst
    }
}

/// Parse `[tokens, last_refill_secs]` as read back from Redis.
fn decode_bucket(key: &str, record: &[String], interval: Duration) -> Result<BucketState> {
    let [tokens, last_refill] = record else {
        return Err(LimiterError::malformed(
            key,
            format!("expected 2 elements, got {}", record.len()),
        ));
    };

    let tokens: f64 = tokens
        .parse()
        .map_err(|e| LimiterError::malformed(key, format!("tokens '{}': {}", tokens, e)))?;
    if !tokens.is_finite() {
        return Err(LimiterError::malformed(key, "tokens is not finite"));
    }

    let last_refill: u64 = last_refill.parse().map_err(|e| {
        LimiterError::malformed(key, format!("last refill '{}': {}", last_refill, e))
    })?;

    Ok(BucketState::new(
        tokens,
        truncate(Duration::from_secs(last_refill), interval),
    ))
}

fn unix_secs(at: Duration) -> i64 {
    i64::try_from(at.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const START: Duration = Duration::from_millis(1_700_000_000_300);

    fn store_failure() -> LimiterError {
        redis::RedisError::from((redis::ErrorKind::IoError, "connection reset")).into()
    }

    /// In-memory stand-in for Redis with failure switches.
    #[derive(Default)]
    struct FakeStore {
        lists: Mutex<HashMap<String, Vec<String>>>,
        fail_get: AtomicBool,
        fail_read: AtomicBool,
        fail_init: AtomicBool,
        fail_write: AtomicBool,
        writes: AtomicUsize,
        released: AtomicUsize,
    }

    impl FakeStore {
        fn put(&self, key: &str, tokens: &str, last_refill: &str) {
            self.lists
                .lock()
                .insert(key.to_string(), vec![tokens.to_string(), last_refill.to_string()]);
        }

        fn bucket(&self, key: &str) -> Option<(f64, i64)> {
            let lists = self.lists.lock();
            let list = lists.get(key)?;
            Some((list[0].parse().unwrap(), list[1].parse().unwrap()))
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    struct FakeProvider(Arc<FakeStore>);

    struct FakeConnection(Arc<FakeStore>);

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectionProvider for FakeProvider {
        type Connection = FakeConnection;

        async fn get(&self) -> Result<FakeConnection> {
            if self.0.fail_get.load(Ordering::SeqCst) {
                return Err(store_failure());
            }
            Ok(FakeConnection(Arc::clone(&self.0)))
        }
    }

    #[async_trait]
    impl StoreConnection for FakeConnection {
        async fn read_bucket(&mut self, key: &str) -> Result<Vec<String>> {
            if self.0.fail_read.load(Ordering::SeqCst) {
                return Err(store_failure());
            }
            Ok(self.0.lists.lock().get(key).cloned().unwrap_or_default())
        }

        async fn init_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()> {
            if self.0.fail_init.load(Ordering::SeqCst) {
                return Err(store_failure());
            }
            self.0.put(key, &tokens.to_string(), &last_refill.to_string());
            Ok(())
        }

        async fn write_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()> {
            if self.0.fail_write.load(Ordering::SeqCst) {
                return Err(store_failure());
            }
            self.0.writes.fetch_add(1, Ordering::SeqCst);
            self.0.put(key, &tokens.to_string(), &last_refill.to_string());
            Ok(())
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        limiter: RedisLimiter<FakeProvider, Arc<ManualClock>>,
        store: Arc<FakeStore>,
        clock: Arc<ManualClock>,
    }

    fn harness(rate: f64, burst: u32, fail_open: bool) -> Harness {
        let config = Config {
            rate,
            burst,
            fail_open,
            ..Default::default()
        };
        let store = Arc::new(FakeStore::default());
        let clock = Arc::new(ManualClock::new(START));
        let limiter = RedisLimiter::with_provider(
            &config,
            FakeProvider(Arc::clone(&store)),
            Arc::clone(&clock),
        );
        Harness {
            limiter,
            store,
            clock,
        }
    }

    fn now_secs(clock: &ManualClock) -> i64 {
        clock.now().as_secs() as i64
    }

    #[tokio::test]
    async fn test_new_key_is_initialized() {
        let h = harness(10.0, 20, false);

        assert!(h.limiter.allow("foo").await);
        assert_eq!(h.store.bucket("foo"), Some((19.0, now_secs(&h.clock))));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_first_touch_costs_one_token_whatever_n_is() {
        let h = harness(10.0, 20, false);

        assert!(h.limiter.allow_n("foo", 5).await);
        assert_eq!(h.store.bucket("foo"), Some((19.0, now_secs(&h.clock))));

        // even asking for more than the burst is admitted on first touch
        assert!(h.limiter.allow_n("bar", 50).await);
        assert_eq!(h.store.bucket("bar"), Some((19.0, now_secs(&h.clock))));
    }

    #[tokio::test]
    async fn test_zero_burst_first_touch_never_goes_negative() {
        let h = harness(1.0, 0, false);

        assert!(h.limiter.allow("foo").await);
        assert_eq!(h.store.bucket("foo"), Some((0.0, now_secs(&h.clock))));
        assert!(!h.limiter.allow("foo").await);
    }

    #[tokio::test]
    async fn test_refill_after_many_intervals() {
        let h = harness(10.0, 20, false);
        let minute_ago = now_secs(&h.clock) - 60;
        h.store.put("foo", "0", &minute_ago.to_string());

        assert!(h.limiter.allow_n("foo", 2).await);
        assert_eq!(h.store.bucket("foo"), Some((18.0, now_secs(&h.clock))));
        assert_eq!(h.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_empty_bucket_is_rejected() {
        let h = harness(10.0, 20, false);
        h.store.put("foo", "0", &now_secs(&h.clock).to_string());

        assert!(!h.limiter.allow_dynamic("foo", 10.0, 20).await);
    }

    #[tokio::test]
    async fn test_rejection_does_not_persist_refill() {
        // The refill computed for a rejected request is thrown away.
        let h = harness(1.0, 5, false);
        let last = now_secs(&h.clock) - 1;
        h.store.put("foo", "0", &last.to_string());

        assert!(!h.limiter.allow_n("foo", 2).await);
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.store.bucket("foo"), Some((0.0, last)));

        // the banked interval is still there for the next request
        assert!(h.limiter.allow("foo").await);
        assert_eq!(h.store.bucket("foo"), Some((0.0, now_secs(&h.clock))));
    }

    #[tokio::test]
    async fn test_more_than_burst_never_spends_tokens() {
        let h = harness(1.0, 4, false);
        let now = now_secs(&h.clock).to_string();
        h.store.put("foo", "4", &now);

        assert!(!h.limiter.allow_n("foo", 5).await);
        assert_eq!(h.store.bucket("foo"), Some((4.0, now_secs(&h.clock))));
    }

    #[tokio::test]
    async fn test_token_bucket_walkthrough() {
        let h = harness(1.0, 2, false);

        // first touch leaves burst - 1
        assert!(h.limiter.allow("k").await);
        h.clock.advance(Duration::from_secs(1));

        assert!(h.limiter.allow_n("k", 2).await);
        assert!(!h.limiter.allow("k").await);

        h.clock.advance(Duration::from_secs(1));
        assert!(h.limiter.allow("k").await);
        assert_eq!(h.store.bucket("k").map(|(tokens, _)| tokens), Some(0.0));

        // two idle intervals refill to the cap, not beyond it
        h.clock.advance(Duration::from_secs(2));
        assert!(!h.limiter.allow_n("k", 3).await);
        assert!(h.limiter.allow_n("k", 2).await);
        assert!(!h.limiter.allow("k").await);
    }

    #[tokio::test]
    async fn test_dynamic_rate_and_burst() {
        let h = harness(0.0, 0, false);
        let ten_ago = now_secs(&h.clock) - 10;
        h.store.put("foo", "0", &ten_ago.to_string());

        assert!(!h.limiter.allow("foo").await);
        assert!(h.limiter.allow_n_dynamic("foo", 3, 1.0, 5).await);
        assert_eq!(h.store.bucket("foo"), Some((2.0, now_secs(&h.clock))));

        // plain calls go back to the configured default
        assert!(!h.limiter.allow("foo").await);
        assert_eq!(h.limiter.rate(), 0.0);
        assert_eq!(h.limiter.burst(), 0);
    }

    #[tokio::test]
    async fn test_clock_skew_grants_nothing() {
        let h = harness(5.0, 10, false);
        let future = now_secs(&h.clock) + 30;
        h.store.put("foo", "1", &future.to_string());

        assert!(h.limiter.allow("foo").await);
        assert!(!h.limiter.allow("foo").await);
    }

    #[tokio::test]
    async fn test_store_errors_follow_fail_open() {
        for fail_open in [true, false] {
            let h = harness(10.0, 20, fail_open);

            h.store.fail_get.store(true, Ordering::SeqCst);
            assert_eq!(h.limiter.allow("foo").await, fail_open);
            h.store.fail_get.store(false, Ordering::SeqCst);

            h.store.fail_read.store(true, Ordering::SeqCst);
            assert_eq!(h.limiter.allow_n("foo", 1).await, fail_open);
            assert_eq!(h.limiter.allow_dynamic("foo", 1.0, 1).await, fail_open);
            assert_eq!(h.limiter.allow_n_dynamic("foo", 1, 1.0, 1).await, fail_open);
            h.store.fail_read.store(false, Ordering::SeqCst);

            h.store.fail_init.store(true, Ordering::SeqCst);
            assert_eq!(h.limiter.allow("foo").await, fail_open);
            assert_eq!(h.store.bucket("foo"), None);
        }
    }

    #[tokio::test]
    async fn test_write_failure_overrides_admission() {
        for fail_open in [true, false] {
            let h = harness(10.0, 20, fail_open);
            h.store.put("foo", "0", "0");
            h.store.fail_write.store(true, Ordering::SeqCst);

            // bucket math admits, the failed write turns it into the fail-open value
            assert_eq!(h.limiter.allow("foo").await, fail_open);
            assert_eq!(h.store.bucket("foo"), Some((0.0, 0)));
            assert_eq!(h.store.released.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_malformed_bucket_follows_fail_open() {
        let h = harness(10.0, 20, false);
        h.store.put("foo", "h", "i");
        assert!(!h.limiter.allow("foo").await);

        let h = harness(10.0, 20, true);
        h.store.put("foo", "1", "-5");
        assert!(h.limiter.allow("foo").await);

        h.store
            .lists
            .lock()
            .insert("bar".to_string(), vec!["1".to_string()]);
        assert!(h.limiter.allow("bar").await);
    }

    #[tokio::test]
    async fn test_connection_released_on_every_path() {
        let h = harness(1.0, 1, false);

        assert!(h.limiter.allow("foo").await); // init
        assert!(!h.limiter.allow("foo").await); // reject
        h.store.fail_read.store(true, Ordering::SeqCst);
        assert!(!h.limiter.allow("foo").await); // error

        assert_eq!(h.store.released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_decode_bucket() {
        let record = vec!["19.5".to_string(), "1700000001".to_string()];
        let bucket = decode_bucket("foo", &record, Duration::from_secs(1)).unwrap();
        assert_eq!(bucket.tokens, 19.5);
        assert_eq!(bucket.last_refill, Duration::from_secs(1_700_000_001));

        let bucket = decode_bucket("foo", &record, Duration::from_secs(60)).unwrap();
        assert_eq!(bucket.last_refill, Duration::from_secs(1_699_999_980));

        let record = vec!["inf".to_string(), "1".to_string()];
        assert!(decode_bucket("foo", &record, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_rate_and_burst_report_configuration() {
        let h = harness(10.0, 20, false);
        assert_eq!(h.limiter.rate(), 10.0);
        assert_eq!(h.limiter.burst(), 20);
        assert_eq!(h.limiter.rate(), 10.0);
        assert_eq!(h.limiter.burst(), 20);
    }
}
