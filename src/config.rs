use crate::config_validator::ConfigValidator;
use crate::error::{LimiterError, Result};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Refill interval used when none is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Which storage realization backs a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Buckets live in Redis and are shared by every process.
    #[serde(alias = "shared")]
    Redis,
    /// Buckets live in this process only.
    #[default]
    #[serde(alias = "local", alias = "in-memory", alias = "inmemory")]
    Memory,
    /// Every request is admitted.
    #[serde(alias = "none")]
    Disabled,
}

impl FromStr for Backend {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" | "shared" => Ok(Backend::Redis),
            "memory" | "local" | "in-memory" | "inmemory" => Ok(Backend::Memory),
            "disabled" | "none" => Ok(Backend::Disabled),
            other => Err(LimiterError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Redis => write!(f, "redis"),
            Backend::Memory => write!(f, "memory"),
            Backend::Disabled => write!(f, "disabled"),
        }
    }
}

/// Limiter configuration, supplied once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    /// Redis address, either `host:port` or a `redis://` URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Tokens added per interval
    #[serde(default)]
    pub rate: f64,

    /// Bucket capacity
    #[serde(default)]
    pub burst: u32,

    /// Refill granularity; zero means "use the default"
    #[serde(default, with = "humantime_serde")]
    pub interval: Duration,

    /// Admit requests when Redis misbehaves
    #[serde(default)]
    pub fail_open: bool,

    /// Upper bound on idle pooled Redis connections
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_url: default_redis_url(),
            rate: 0.0,
            burst: 0,
            interval: Duration::ZERO,
            fail_open: false,
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_idle_connections() -> usize {
    8
}

impl Config {
    /// Load configuration from `TOLLGATE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(backend) = env_var("TOLLGATE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(url) = env_var("TOLLGATE_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(rate) = env_var("TOLLGATE_RATE") {
            config.rate = parse_var("TOLLGATE_RATE", &rate)?;
        }
        if let Some(burst) = env_var("TOLLGATE_BURST") {
            config.burst = parse_var("TOLLGATE_BURST", &burst)?;
        }
        if let Some(interval) = env_var("TOLLGATE_INTERVAL") {
            config.interval = humantime::parse_duration(&interval).map_err(|e| {
                LimiterError::Config(format!("TOLLGATE_INTERVAL '{}': {}", interval, e))
            })?;
        }
        if let Some(fail_open) = env_var("TOLLGATE_FAIL_OPEN") {
            config.fail_open = parse_var("TOLLGATE_FAIL_OPEN", &fail_open)?;
        }
        if let Some(max_idle) = env_var("TOLLGATE_MAX_IDLE") {
            config.max_idle_connections = parse_var("TOLLGATE_MAX_IDLE", &max_idle)?;
        }

        Ok(config)
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LimiterError::Config(e.to_string()))
    }

    /// The refill interval with the one second default applied.
    pub fn effective_interval(&self) -> Duration {
        if self.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            self.interval
        }
    }

    /// The Redis address as a connection URL.
    pub fn redis_connection_url(&self) -> String {
        let address = self.redis_url.trim();
        if address.contains("://") {
            address.to_string()
        } else if let Some(port) = address.strip_prefix(':') {
            format!("redis://127.0.0.1:{}", port)
        } else {
            format!("redis://{}", address)
        }
    }

    /// Check the fields the selected backend depends on.
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_rate(self.rate)?;
        ConfigValidator::validate_interval(self.effective_interval())?;
        if self.backend == Backend::Redis {
            ConfigValidator::validate_redis_url(&self.redis_connection_url())?;
            ConfigValidator::validate_pool_size(self.max_idle_connections)?;
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LimiterError::Config(format!("{} '{}': {}", name, value, e)))
}
