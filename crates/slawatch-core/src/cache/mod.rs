//! Derived, disposable state: the cache backend and the run cache on top of it.
//!
//! Nothing stored through [`CacheBackend`] is a source of truth. Every
//! entry can be dropped at any time and rebuilt from the canonical store.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod runs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CacheBackendKind, CacheConfig};
use crate::error::{CacheError, ConfigError, Result};

pub use memory::MemoryCacheBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisCacheBackend;
pub use runs::RunCache;

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Redis-shaped key/value operations shared by the run cache and the deadline index.
///
/// Sorted-set reads order by score, then by member, like Redis does.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    // -- sorted sets ---------------------------------------------------------

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<()>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
    -> CacheResult<Vec<(String, f64)>>;

    /// Members by descending score between ranks `start..=stop` (negative counts from the end).
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>>;

    async fn zcard(&self, key: &str) -> CacheResult<u64>;

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>>;

    /// Remove members by ascending rank `start..=stop` (negative counts from the end).
    async fn zremrange_by_rank(&self, key: &str, start: isize, stop: isize) -> CacheResult<()>;

    // -- hashes --------------------------------------------------------------

    async fn hget(&self, key: &str, field: &str) -> CacheResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;

    async fn hdel(&self, key: &str, field: &str) -> CacheResult<()>;

    // -- sets ----------------------------------------------------------------

    async fn sadd(&self, key: &str, member: &str) -> CacheResult<()>;

    async fn srem(&self, key: &str, member: &str) -> CacheResult<()>;

    async fn sismember(&self, key: &str, member: &str) -> CacheResult<bool>;

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>>;

    // -- plain keys ----------------------------------------------------------

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    /// Set a time-to-live on any existing key. No-op for missing keys.
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;

    // -- pipelined batches ---------------------------------------------------

    /// One round trip; the result is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>>;

    /// One round trip setting every entry with the same TTL.
    async fn mset_ex(&self, entries: &[(String, String)], ttl: Duration) -> CacheResult<()>;
}

/// Build the backend selected by `[cache] backend`.
pub async fn connect_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
    match config.backend {
        CacheBackendKind::Memory => Ok(Arc::new(MemoryCacheBackend::new())),
        CacheBackendKind::Redis => connect_redis(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
    let url = config.redis_url.as_deref().ok_or_else(|| {
        ConfigError::ValidationError("cache.redis_url is required for the redis backend".into())
    })?;
    let backend =
        RedisCacheBackend::connect(url, config.command_timeout(), config.connect_timeout()).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
    Err(ConfigError::ValidationError(
        "cache.backend = \"redis\" requires building with the `redis` feature".into(),
    )
    .into())
}
