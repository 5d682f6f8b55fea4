//! Redis-backed [`CacheBackend`] (feature `redis`).
//!
//! One multiplexed async connection shared by all callers. Every command is
//! bounded by the configured command timeout; a timeout surfaces as
//! [`CacheError::Unavailable`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::time::timeout;
use tracing::info;

use super::{CacheBackend, CacheResult};
use crate::error::CacheError;

#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: MultiplexedConnection,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheBackend")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisCacheBackend {
    pub async fn connect(
        url: &str,
        command_timeout: Duration,
        connect_timeout: Duration,
    ) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                CacheError::Unavailable(format!(
                    "redis connect timed out after {}ms",
                    connect_timeout.as_millis()
                ))
            })??;
        info!(command_timeout_ms = command_timeout.as_millis() as u64, "Connected to redis");
        Ok(Self {
            conn,
            command_timeout,
        })
    }

    async fn timed<T, F>(&self, op: F) -> CacheResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.command_timeout, op).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Unavailable(format!(
                "redis command timed out after {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zadd(key, member, score).await })
            .await
    }

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zrem(key, member).await }).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> CacheResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zrangebyscore_withscores(key, min, max).await })
            .await
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zrevrange(key, start, stop).await })
            .await
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zcard(key).await }).await
    }

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zscore(key, member).await })
            .await
    }

    async fn zremrange_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.zremrangebyrank(key, start, stop).await })
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.hget(key, field).await }).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.hset(key, field, value).await })
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.hdel(key, field).await }).await
    }

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.sadd(key, member).await }).await
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.srem(key, member).await }).await
    }

    async fn sismember(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.sismember(key, member).await })
            .await
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.smembers(key).await }).await
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.get(key).await }).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.set_ex(key, value, ttl_secs(ttl)).await })
            .await
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        self.timed(async move { conn.del(key).await }).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        self.timed(async move { conn.expire(key, secs).await }).await
    }

    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.timed(async move { redis::cmd("MGET").arg(keys).query_async(&mut conn).await })
            .await
    }

    async fn mset_ex(&self, entries: &[(String, String)], ttl: Duration) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set_ex(key, value, ttl_secs(ttl)).ignore();
        }
        let mut conn = self.conn.clone();
        self.timed(async move { pipe.query_async(&mut conn).await })
            .await
    }
}
