//! Pooled Redis connections and the list primitives the shared backend needs.
//!
//! Each bucket is a two element Redis list: `[tokens, last_refill_secs]`.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Idle connections older than this are PINGed before reuse.
pub const TEST_ON_BORROW_AFTER: Duration = Duration::from_secs(60);

/// A borrowed connection to the bucket store.
#[async_trait]
pub trait StoreConnection: Send {
    /// `LRANGE key 0 1`; empty when the key does not exist.
    async fn read_bucket(&mut self, key: &str) -> Result<Vec<String>>;

    /// Create the record for a key seen for the first time.
    async fn init_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()>;

    /// Overwrite both elements of an existing record in one transaction.
    async fn write_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()>;

    async fn ping(&mut self) -> Result<()>;
}

/// Hands out store connections. Dropping the connection releases it.
#[async_trait]
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: StoreConnection;

    async fn get(&self) -> Result<Self::Connection>;
}

struct IdleConnection {
    conn: MultiplexedConnection,
    returned_at: Instant,
}

type IdleList = Arc<Mutex<Vec<IdleConnection>>>;

/// Small connection pool over a single Redis endpoint.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    idle: IdleList,
    max_idle: usize,
}

impl RedisPool {
    /// Build a pool for `redis_url`. No connection is made until first use.
    pub fn new(redis_url: &str, max_idle: usize) -> Result<Self> {
        Ok(Self {
            client: Client::open(redis_url)?,
            idle: Arc::new(Mutex::new(Vec::new())),
            max_idle: max_idle.max(1),
        })
    }

    /// Borrow a connection, reusing an idle one when it is still alive.
    pub async fn get(&self) -> Result<PooledConnection> {
        loop {
            let idle = self.idle.lock().pop();
            let Some(idle) = idle else {
                break;
            };

            let mut conn = self.wrap(idle.conn);
            if idle.returned_at.elapsed() < TEST_ON_BORROW_AFTER {
                return Ok(conn);
            }
            match conn.ping().await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    debug!(error = %e, "Discarding stale pooled Redis connection");
                    conn.broken = true;
                }
            }
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Opened new Redis connection");
        Ok(self.wrap(conn))
    }

    /// Round-trip a PING through a pooled connection.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get().await?;
        conn.ping().await
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    fn wrap(&self, conn: MultiplexedConnection) -> PooledConnection {
        PooledConnection {
            conn,
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
            broken: false,
        }
    }
}

#[async_trait]
impl ConnectionProvider for RedisPool {
    type Connection = PooledConnection;

    async fn get(&self) -> Result<PooledConnection> {
        RedisPool::get(self).await
    }
}

/// A connection borrowed from [`RedisPool`], returned to it on drop.
pub struct PooledConnection {
    conn: MultiplexedConnection,
    idle: IdleList,
    max_idle: usize,
    broken: bool,
}

impl PooledConnection {
    fn track<T>(&mut self, result: RedisResult<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io_error() || e.is_connection_dropped() {
                self.broken = true;
            }
        }
        Ok(result?)
    }
}

#[async_trait]
impl StoreConnection for PooledConnection {
    async fn read_bucket(&mut self, key: &str) -> Result<Vec<String>> {
        let result = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(1)
            .query_async::<_, Vec<String>>(&mut self.conn)
            .await;
        self.track(result)
    }

    async fn init_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()> {
        // A concurrent initializer's elements are trimmed off the tail.
        let result = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(tokens)
            .arg(last_refill)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(1)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await;
        self.track(result)
    }

    async fn write_bucket(&mut self, key: &str, tokens: f64, last_refill: i64) -> Result<()> {
        let result = redis::pipe()
            .atomic()
            .cmd("LSET")
            .arg(key)
            .arg(0)
            .arg(tokens)
            .ignore()
            .cmd("LSET")
            .arg(key)
            .arg(1)
            .arg(last_refill)
            .ignore()
            .query_async::<_, ()>(&mut self.conn)
            .await;
        self.track(result)
    }

    async fn ping(&mut self) -> Result<()> {
        let result = redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn)
            .await;
        self.track(result).map(|_| ())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(IdleConnection {
                conn: self.conn.clone(),
                returned_at: Instant::now(),
            });
        }
    }
}
