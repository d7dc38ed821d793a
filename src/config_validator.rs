use crate::error::LimiterError;
use std::time::Duration;

/// Validates configuration values before a limiter is built
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), LimiterError> {
        if url.is_empty() {
            return Err(LimiterError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(LimiterError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the default refill rate
    pub fn validate_rate(rate: f64) -> Result<(), LimiterError> {
        if !rate.is_finite() {
            return Err(LimiterError::Validation(
                "Rate must be a finite number".to_string(),
            ));
        }

        if rate < 0.0 {
            return Err(LimiterError::Validation(
                "Rate cannot be negative".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the refill interval
    pub fn validate_interval(interval: Duration) -> Result<(), LimiterError> {
        if interval.is_zero() {
            return Err(LimiterError::Validation(
                "Interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the idle connection cap
    pub fn validate_pool_size(max_idle: usize) -> Result<(), LimiterError> {
        if max_idle == 0 {
            return Err(LimiterError::Validation(
                "Connection pool must keep at least one idle connection".to_string(),
            ));
        }

        Ok(())
    }
}
