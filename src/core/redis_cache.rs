//! Redis-backed [`CacheStore`] shared by every gateway replica.

use crate::core::cache::{CacheError, CacheResult, CacheStore};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// INCR and PEXPIRE in one round trip, so a counter can never exist without
/// its expiry.
const INCR_WITH_EXPIRY_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Redis client with automatic reconnection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    command_timeout: Duration,
    incr_script: Arc<redis::Script>,
}

impl RedisCache {
    /// Connect to Redis. Supports both `redis://` and `rediss://` URLs.
    pub async fn connect(url: &str, command_timeout: Duration) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(command_timeout))??;

        tracing::info!(command_timeout_ms = command_timeout.as_millis() as u64, "Connected to Redis");

        Ok(Self {
            conn,
            command_timeout,
            incr_script: Arc::new(redis::Script::new(INCR_WITH_EXPIRY_SCRIPT)),
        })
    }

    /// Release this handle. The underlying connection closes once every
    /// clone has been dropped.
    pub fn close(self) {
        tracing::info!("Closing Redis connection");
        drop(self);
    }

    async fn bounded<T, F>(&self, fut: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(self.command_timeout))?
            .map_err(CacheError::from)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let mut conn = self.conn.clone();
        let script = self.incr_script.clone();
        self.bounded(async move {
            script
                .key(key)
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = self.bounded(async move { conn.del(key).await }).await?;
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}
