//! In-memory cache implementation for testing and development.

use super::{glob_match, Cache, CacheResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

/// A single cache entry with value and expiration.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false,
        }
    }
}

/// An in-memory [`Cache`] backend over `tokio::sync::RwLock`-guarded maps.
///
/// Supports TTL, glob scans, and set membership with the same observable
/// semantics as the Redis backend. Intended for tests and development.
#[derive(Debug, Default)]
pub struct MockCache {
    data: RwLock<HashMap<String, CacheEntry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MockCache {
    /// Creates an empty mock cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries.
    pub async fn cleanup_expired(&self) {
        let mut data = self.data.write().await;
        data.retain(|_, entry| !entry.is_expired());
    }

    /// Forces a key to expire immediately. Test hook for TTL-elapsed paths.
    pub async fn expire_now(&self, key: &str) {
        let mut data = self.data.write().await;
        if let Some(entry) = data.get_mut(key) {
            entry.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        }
    }
}

#[async_trait]
impl Cache for MockCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + ChronoDuration::milliseconds(ttl.as_millis() as i64))
        };
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed_value = self.data.write().await.remove(key).is_some();
        let removed_set = self.sets.write().await.remove(key).is_some();
        Ok(removed_value || removed_set)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let data = self.data.read().await;
        Ok(matches!(data.get(key), Some(entry) if !entry.is_expired()))
    }

    async fn scan_match(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let data = self.data.read().await;
        let sets = self.sets.read().await;
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.extend(
            sets.keys()
                .filter(|key| glob_match(pattern, key))
                .cloned(),
        );
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut sets = self.sets.write().await;
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> CacheResult<()> {
        let mut sets = self.sets.write().await;
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        let sets = self.sets.read().await;
        Ok(sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
