use crate::rate_limiter::Limiter;
use async_trait::async_trait;

/// Limiter that admits everything. Useful in tests and local development.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLimiter;

#[async_trait]
impl Limiter for DisabledLimiter {
    async fn allow_n(&self, _key: &str, _n: u32) -> bool {
        true
    }

    async fn allow_n_dynamic(&self, _key: &str, _n: u32, _rate: f64, _burst: u32) -> bool {
        true
    }

    fn rate(&self) -> f64 {
        f64::MAX
    }

    fn burst(&self) -> u32 {
        0
    }
}
