pub mod backends;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod health;
pub mod rate_limiter;
pub mod redis_pool;
pub mod token_bucket;

pub use config::{Backend, Config};
pub use error::{LimiterError, Result};
pub use rate_limiter::{new_limiter, Limiter};
