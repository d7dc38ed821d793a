use crate::backends::{DisabledLimiter, MemoryLimiter, RedisLimiter};
use crate::config::{Backend, Config};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Token bucket admission gate.
///
/// Calls never fail. Backend trouble shows up only as the boolean decision,
/// which for Redis follows the configured fail-open policy.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Take one token from `key` under the configured rate and burst.
    async fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1).await
    }

    /// Take `n` tokens from `key` under the configured rate and burst.
    async fn allow_n(&self, key: &str, n: u32) -> bool;

    /// Take one token from `key` under the given rate and burst.
    async fn allow_dynamic(&self, key: &str, rate: f64, burst: u32) -> bool {
        self.allow_n_dynamic(key, 1, rate, burst).await
    }

    /// Take `n` tokens from `key` under the given rate and burst.
    ///
    /// The in-memory backend keeps `rate` and `burst` as the key's limits until
    /// a call with different ones arrives.
    async fn allow_n_dynamic(&self, key: &str, n: u32, rate: f64, burst: u32) -> bool;

    /// Configured tokens per interval.
    fn rate(&self) -> f64;

    /// Configured bucket capacity.
    fn burst(&self) -> u32;
}

/// Build the limiter selected by `config.backend`.
pub fn new_limiter(config: Config) -> Result<Arc<dyn Limiter>> {
    config.validate()?;

    info!(
        backend = %config.backend,
        rate = config.rate,
        burst = config.burst,
        interval = ?config.effective_interval(),
        fail_open = config.fail_open,
        "Building rate limiter"
    );

    let limiter: Arc<dyn Limiter> = match config.backend {
        Backend::Redis => Arc::new(RedisLimiter::new(&config)?),
        Backend::Memory => Arc::new(MemoryLimiter::new(&config)),
        Backend::Disabled => Arc::new(DisabledLimiter),
    };
    Ok(limiter)
}
