use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tollgate::backends::RedisLimiter;
use tollgate::clock::SystemClock;
use tollgate::config::{Backend, Config};
use tollgate::health::HealthChecker;
use tollgate::redis_pool::RedisPool;
use tollgate::Limiter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Walk two keys through a token bucket and print each decision.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version)]
struct Args {
    /// Backend: redis, memory or disabled (defaults to TOLLGATE_BACKEND)
    #[arg(long)]
    backend: Option<Backend>,

    /// Redis address, `host:port` or `redis://...`
    #[arg(long)]
    redis_url: Option<String>,

    /// Tokens added per interval
    #[arg(long, default_value_t = 1.0)]
    rate: f64,

    /// Bucket capacity
    #[arg(long, default_value_t = 2)]
    burst: u32,

    /// Refill interval, e.g. `1s` or `500ms`
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration, default_value = "1s")]
    interval: Duration,

    /// Admit requests when Redis is unreachable
    #[arg(long)]
    fail_open: bool,

    #[arg(long, default_value = "key1")]
    first_key: String,

    #[arg(long, default_value = "key2")]
    second_key: String,

    /// Log filter
    #[arg(long, default_value = "tollgate=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(url) = args.redis_url {
        config.redis_url = url;
    }
    config.rate = args.rate;
    config.burst = args.burst;
    config.interval = args.interval;
    config.fail_open = args.fail_open;

    let limiter = match config.backend {
        Backend::Redis => {
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Failed to create limiter: {}", e))?;
            // the health check and the limiter share one pool
            let pool =
                RedisPool::new(&config.redis_connection_url(), config.max_idle_connections)?;
            let health = HealthChecker::new(Some(pool.clone())).check().await;
            tracing::info!("Store health: {}", serde_json::to_string(&health)?);
            Arc::new(RedisLimiter::with_provider(&config, pool, SystemClock)) as Arc<dyn Limiter>
        }
        _ => tollgate::new_limiter(config.clone())
            .map_err(|e| anyhow::anyhow!("Failed to create limiter: {}", e))?,
    };
    let interval = config.effective_interval();
    let (key1, key2) = (args.first_key.as_str(), args.second_key.as_str());

    // let buckets left over from a previous run fill back up
    tokio::time::sleep(interval * config.burst).await;

    report("allow_n(key1, 2)", true, limiter.allow_n(key1, 2).await);
    report("allow(key2)", true, limiter.allow(key2).await);

    tokio::time::sleep(interval).await;

    report("allow(key1)", true, limiter.allow(key1).await);
    report("allow_n(key2, 2)", true, limiter.allow_n(key2, 2).await);

    report("allow(key1)", false, limiter.allow(key1).await);
    report("allow(key2)", false, limiter.allow(key2).await);

    Ok(())
}

fn report(call: &str, expected: bool, actual: bool) {
    println!("{:<20}{} == {}", call, expected, actual);
}
