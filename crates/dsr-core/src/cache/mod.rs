//! Cache abstraction backing the keyed request store.
//!
//! This module provides a backend-generic [`Cache`] trait with TTL support,
//! glob-pattern key scanning, and atomic set-membership operations (used for
//! the per-request key index). Two implementations ship with the crate:
//! [`MockCache`] (in-memory, for tests and development) and [`RedisCache`]
//! (pooled Redis backend).
//!
//! Keys are stored verbatim — the store layer above owns the key namespace,
//! and the on-wire key formats are contractual for interoperability with
//! existing deployments.

mod error;
mod mock;
mod redis;
pub mod store;

pub use error::{CacheError, CacheResult};
pub use mock::MockCache;
pub use redis::{RedisCache, RedisCacheConfig};
pub use store::{RequestCache, StoreConfig};

use async_trait::async_trait;
use std::time::Duration;

/// A trait for cache backends supporting TTL, key scans, and atomic sets.
///
/// Implementations must be thread-safe (`Send + Sync`). A TTL of
/// `Duration::ZERO` means no expiration. Set operations must have atomic
/// element add/remove semantics (SADD/SREM-equivalent); whole-set locking is
/// neither assumed nor required.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Gets a value by key. `Ok(None)` if absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Sets a value with a TTL. `Duration::ZERO` means never expire.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Deletes a key (value or set). Returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Whether a live (unexpired) value exists at the key.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Returns all keys matching a glob pattern (`*` wildcards), covering
    /// both value and set keys.
    async fn scan_match(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Atomically adds a member to the set at `key`, creating it if absent.
    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()>;

    /// Atomically removes a member from the set at `key`. No-op if absent.
    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<()>;

    /// Returns all members of the set at `key`; empty if the set is absent.
    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>>;
}

/// Matches a key against a glob pattern using `*` wildcards only.
///
/// Shared by in-memory backends; Redis evaluates patterns server-side.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut remainder = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(part) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return remainder.ends_with(part);
        } else {
            match remainder.find(part) {
                Some(pos) => remainder = &remainder[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match_contains() {
        assert!(glob_match("*abc*", "dsr:abc:identity:email"));
        assert!(glob_match("*abc*", "id-abc-identity-email"));
        assert!(!glob_match("*abc*", "dsr:xyz:identity:email"));
    }

    #[test]
    fn test_glob_match_prefix_and_suffix() {
        assert!(glob_match("dsr:*", "dsr:r1:retry_count"));
        assert!(!glob_match("dsr:*", "__idx:dsr:r1"));
        assert!(glob_match("*:email", "dsr:r1:identity:email"));
        assert!(!glob_match("*:email", "dsr:r1:identity:phone"));
    }

    #[test]
    fn test_glob_match_exact() {
        assert!(glob_match("dsr:r1:retry_count", "dsr:r1:retry_count"));
        assert!(!glob_match("dsr:r1:retry_count", "dsr:r1:retry"));
    }

    #[tokio::test]
    async fn test_mock_implements_cache_trait() {
        async fn roundtrip<C: Cache>(cache: &C) -> CacheResult<Option<Vec<u8>>> {
            cache.set("key", b"value", Duration::from_secs(60)).await?;
            cache.get("key").await
        }

        let cache = MockCache::new();
        let value = roundtrip(&cache).await.unwrap();
        assert_eq!(value, Some(b"value".to_vec()));
    }
}
