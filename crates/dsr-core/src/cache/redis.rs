//! Redis-based cache implementation.
//!
//! Production backend using a `deadpool-redis` connection pool. Keys are used
//! verbatim (no prefixing) because the store layer's key formats are
//! contractual for interoperability with existing deployments. The per-request
//! index uses Redis sets, whose SADD/SREM operations give the atomic
//! element-level semantics the index requires under concurrent writers.

use super::{Cache, CacheError, CacheResult};
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

/// Configuration for the Redis cache backend.
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Redis connection URL (e.g. "redis://localhost:6379").
    pub url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// COUNT hint passed to SCAN.
    pub scan_count: usize,
}

impl RedisCacheConfig {
    /// Creates a configuration with the given Redis URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 16,
            scan_count: 100,
        }
    }

    /// Sets the maximum number of pooled connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self::new("redis://localhost:6379")
    }
}

/// A Redis-backed [`Cache`] implementation.
///
/// Thread-safe; the connection pool handles concurrent access.
pub struct RedisCache {
    pool: Pool,
    config: RedisCacheConfig,
}

impl RedisCache {
    /// Creates a new Redis cache and verifies connectivity with a PING.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Connection` if the pool cannot be built or the
    /// backend does not answer.
    pub async fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| CacheError::Connection(format!("failed to create pool config: {}", e)))?
            .max_size(config.max_connections as usize)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(format!("failed to build pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("failed to get connection: {}", e)))?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| CacheError::Connection(format!("redis PING failed: {}", e)))?;

        Ok(Self { pool, config })
    }

    async fn get_conn(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(format!("failed to get connection: {}", e)))
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.config.url)
            .finish()
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.get_conn().await?;
        conn.get(key)
            .await
            .map_err(|e| CacheError::Backend(format!("redis GET failed: {}", e)))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.get_conn().await?;
        if ttl.is_zero() {
            let _: () = conn
                .set(key, value)
                .await
                .map_err(|e| CacheError::Backend(format!("redis SET failed: {}", e)))?;
        } else {
            let ttl_secs = ttl.as_secs().max(1);
            let _: () = conn
                .set_ex(key, value, ttl_secs)
                .await
                .map_err(|e| CacheError::Backend(format!("redis SETEX failed: {}", e)))?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.get_conn().await?;
        let deleted: i32 = conn
            .del(key)
            .await
            .map_err(|e| CacheError::Backend(format!("redis DEL failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.get_conn().await?;
        conn.exists(key)
            .await
            .map_err(|e| CacheError::Backend(format!("redis EXISTS failed: {}", e)))
    }

    async fn scan_match(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.config.scan_count)
                .query_async(&mut *conn)
                .await
                .map_err(|e| CacheError::Backend(format!("redis SCAN failed: {}", e)))?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .sadd(key, member)
            .await
            .map_err(|e| CacheError::Backend(format!("redis SADD failed: {}", e)))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .srem(key, member)
            .await
            .map_err(|e| CacheError::Backend(format!("redis SREM failed: {}", e)))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.get_conn().await?;
        conn.smembers(key)
            .await
            .map_err(|e| CacheError::Backend(format!("redis SMEMBERS failed: {}", e)))
    }
}
