use std::time::{Instant, SystemTime};
use serde::{Deserialize, Serialize};

use crate::redis_pool::RedisPool;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Reports whether the shared store behind a limiter is reachable.
pub struct HealthChecker {
    pool: Option<RedisPool>,
}

impl HealthChecker {
    pub fn new(pool: Option<RedisPool>) -> Self {
        Self { pool }
    }

    pub async fn check(&self) -> HealthStatus {
        let store = self.check_store().await;

        let status = match store.status.as_str() {
            "unavailable" => "degraded",
            _ => "healthy",
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store,
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let Some(pool) = &self.pool else {
            return ServiceStatus {
                status: "not_configured".to_string(),
                response_time_ms: 0,
                error: None,
            };
        };

        let start = Instant::now();
        let result = pool.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}
