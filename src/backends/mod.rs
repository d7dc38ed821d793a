//! Concrete limiter backends.
//!
//! Each one implements [`crate::Limiter`]; [`crate::new_limiter`] picks one
//! from configuration.

mod disabled;
mod local;
mod shared;

pub use disabled::DisabledLimiter;
pub use local::MemoryLimiter;
pub use shared::RedisLimiter;
