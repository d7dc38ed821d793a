use thiserror::Error;

/// Errors raised while building a limiter or talking to the shared store.
///
/// None of these ever reach callers of [`crate::Limiter`]; per-call failures
/// are folded into the fail-open decision by the backend.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed bucket for key '{key}': {reason}")]
    MalformedBucket { key: String, reason: String },

    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl LimiterError {
    pub(crate) fn malformed(key: &str, reason: impl Into<String>) -> Self {
        LimiterError::MalformedBucket {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LimiterError>;
