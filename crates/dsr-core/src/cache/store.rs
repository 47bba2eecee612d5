//! Keyed request store: namespaced cache access for privacy request artifacts.
//!
//! Every cached artifact for a request `R` lives under a versioned key
//! `dsr:{R}:{part}`, with a per-request index set at `__idx:dsr:{R}` so that
//! "all keys for R" is an O(index-size) lookup instead of a key-space scan.
//! Older deployments wrote flat `id-{R}-...` keys; reads tolerate those and
//! migrate them forward opportunistically (copy-then-delete, so the value is
//! never unreadable mid-migration).
//!
//! Key formats are contractual. Do not change them without a migration plan
//! for live deployments.

use super::{Cache, CacheError, CacheResult};
use crate::checkpoint::CheckpointActionRequired;
use crate::request::{ActionType, RequestId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// TTL and migration policy for the request store.
///
/// Cached artifacts are best-effort state: anything here may be absent at any
/// time, and callers must branch on misses as data rather than errors.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// TTL for cached identity attributes. Expiry triggers automatic
    /// resubmission on retry-from-failure.
    pub identity_ttl: Duration,
    /// TTL for identity verification codes.
    pub verification_code_ttl: Duration,
    /// Whether legacy-key reads rewrite the value to the current format.
    pub migrate_on_read: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            verification_code_ttl: Duration::from_secs(60 * 60),
            migrate_on_read: true,
        }
    }
}

/// Namespaced, indexed cache access scoped to privacy request ids.
///
/// Generic over the [`Cache`] backend; construct over [`super::MockCache`] in
/// tests and [`super::RedisCache`] in production.
#[derive(Debug)]
pub struct RequestCache<C: Cache> {
    backend: Arc<C>,
    config: StoreConfig,
}

impl<C: Cache> Clone for RequestCache<C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

fn request_key(id: &RequestId, part: &str) -> String {
    format!("dsr:{}:{}", id, part)
}

fn index_key(id: &RequestId) -> String {
    format!("__idx:dsr:{}", id)
}

impl<C: Cache> RequestCache<C> {
    /// Creates a store over the given backend.
    pub fn new(backend: Arc<C>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<C> {
        &self.backend
    }

    /// Writes a value at `dsr:{id}:{part}`.
    ///
    /// The key is registered in the request's index before the value write,
    /// so enumeration never silently misses a live key. A `ttl` of `None`
    /// means no expiry.
    pub async fn set_part<T: Serialize>(
        &self,
        id: &RequestId,
        part: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let key = request_key(id, part);
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CacheError::Serialization(format!("failed to encode {}: {}", key, e)))?;
        self.backend.set_add(&index_key(id), &key).await?;
        self.backend
            .set(&key, &bytes, ttl.unwrap_or(Duration::ZERO))
            .await
    }

    /// Reads a value at `dsr:{id}:{part}`. No legacy fallback.
    pub async fn get_part<T: DeserializeOwned>(
        &self,
        id: &RequestId,
        part: &str,
    ) -> CacheResult<Option<T>> {
        let key = request_key(id, part);
        match self.backend.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Reads a value, probing a legacy key when the current one misses.
    ///
    /// When migration-on-read is enabled and the legacy key hits, the value
    /// is copied forward before the legacy key is deleted. A failed delete
    /// after a successful copy leaves a harmless duplicate and is logged,
    /// not treated as an error.
    pub async fn get_with_legacy<T: DeserializeOwned>(
        &self,
        id: &RequestId,
        part: &str,
        legacy_key: &str,
    ) -> CacheResult<Option<T>> {
        let key = request_key(id, part);
        if let Some(bytes) = self.backend.get(&key).await? {
            return Ok(Some(decode(&key, &bytes)?));
        }

        let Some(bytes) = self.backend.get(legacy_key).await? else {
            return Ok(None);
        };
        let value = decode(&key, &bytes)?;

        if self.config.migrate_on_read {
            self.backend.set_add(&index_key(id), &key).await?;
            self.backend.set(&key, &bytes, Duration::ZERO).await?;
            if let Err(e) = self.backend.delete(legacy_key).await {
                warn!(
                    legacy_key,
                    new_key = %key,
                    error = %e,
                    "migrated legacy cache key but failed to delete the old one"
                );
            } else {
                debug!(legacy_key, new_key = %key, "migrated legacy cache key");
            }
        }
        Ok(Some(value))
    }

    /// Deletes `dsr:{id}:{part}` and removes it from the index. Idempotent.
    pub async fn delete_part(&self, id: &RequestId, part: &str) -> CacheResult<()> {
        let key = request_key(id, part);
        self.backend.delete(&key).await?;
        self.backend.set_remove(&index_key(id), &key).await
    }

    /// Returns all cache keys recorded for a request.
    ///
    /// Uses the index set when populated; otherwise falls back to a pattern
    /// scan for any key containing the id (legacy compatibility) and, when
    /// migration-on-read is enabled, backfills the index with what it finds.
    /// Never errors on "nothing exists" — that is an empty list.
    pub async fn get_all_keys(&self, id: &RequestId) -> CacheResult<Vec<String>> {
        let idx = index_key(id);
        let indexed = self.backend.set_members(&idx).await?;
        if !indexed.is_empty() {
            return Ok(indexed);
        }

        let pattern = format!("*{}*", id);
        let mut scanned = self.backend.scan_match(&pattern).await?;
        scanned.retain(|key| key != &idx);
        if self.config.migrate_on_read {
            for key in &scanned {
                self.backend.set_add(&idx, key).await?;
            }
        }
        Ok(scanned)
    }

    /// Removes every cached artifact for a request, current and legacy.
    ///
    /// Scans unconditionally rather than trusting the index, so teardown is
    /// complete even when the index was never backfilled. Returns the number
    /// of keys deleted.
    pub async fn clear(&self, id: &RequestId) -> CacheResult<usize> {
        let pattern = format!("*{}*", id);
        let keys = self.backend.scan_match(&pattern).await?;
        let mut deleted = 0;
        for key in &keys {
            if self.backend.delete(key).await? {
                deleted += 1;
            }
        }
        self.backend.delete(&index_key(id)).await?;
        debug!(request_id = %id, deleted, "cleared request cache");
        Ok(deleted)
    }

    // --- identity attributes ---

    /// Caches one identity attribute (e.g. `email`) with the identity TTL.
    pub async fn set_identity_attribute(
        &self,
        id: &RequestId,
        attr: &str,
        value: &Value,
    ) -> CacheResult<()> {
        self.set_part(
            id,
            &format!("identity:{}", attr),
            value,
            Some(self.config.identity_ttl),
        )
        .await
    }

    /// Reads one identity attribute, falling back to the legacy key.
    pub async fn get_identity_attribute(
        &self,
        id: &RequestId,
        attr: &str,
    ) -> CacheResult<Option<Value>> {
        let legacy = format!("id-{}-identity-{}", id, attr);
        self.get_with_legacy(id, &format!("identity:{}", attr), &legacy)
            .await
    }

    /// Returns every cached identity attribute for a request.
    pub async fn get_identity(&self, id: &RequestId) -> CacheResult<HashMap<String, Value>> {
        let prefix = request_key(id, "identity:");
        let mut identity = HashMap::new();
        for key in self.get_all_keys(id).await? {
            let Some(attr) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(bytes) = self.backend.get(&key).await? {
                identity.insert(attr.to_string(), decode(&key, &bytes)?);
            }
        }
        Ok(identity)
    }

    // --- custom request fields ---

    /// Caches one custom privacy request field.
    pub async fn set_custom_field(
        &self,
        id: &RequestId,
        field_key: &str,
        value: &Value,
    ) -> CacheResult<()> {
        self.set_part(id, &format!("custom_field:{}", field_key), value, None)
            .await
    }

    /// Reads one custom field, falling back to the legacy key.
    pub async fn get_custom_field(
        &self,
        id: &RequestId,
        field_key: &str,
    ) -> CacheResult<Option<Value>> {
        let legacy = format!("id-{}-custom-privacy-request-field-{}", id, field_key);
        self.get_with_legacy(id, &format!("custom_field:{}", field_key), &legacy)
            .await
    }

    // --- DRP body fields ---

    /// Caches one Data Rights Protocol body field.
    pub async fn set_drp_attribute(
        &self,
        id: &RequestId,
        attr: &str,
        value: &Value,
    ) -> CacheResult<()> {
        self.set_part(id, &format!("drp:{}", attr), value, None).await
    }

    /// Reads one DRP body field, falling back to the legacy key.
    pub async fn get_drp_attribute(
        &self,
        id: &RequestId,
        attr: &str,
    ) -> CacheResult<Option<Value>> {
        let legacy = format!("id-{}-drp-{}", id, attr);
        self.get_with_legacy(id, &format!("drp:{}", attr), &legacy)
            .await
    }

    // --- masking secrets ---

    /// Caches a masking secret for one (strategy, secret type) pair.
    pub async fn set_masking_secret(
        &self,
        id: &RequestId,
        strategy: &str,
        secret_type: &str,
        value: &Value,
    ) -> CacheResult<()> {
        self.set_part(
            id,
            &format!("masking_secret:{}:{}", strategy, secret_type),
            value,
            None,
        )
        .await
    }

    /// Reads a masking secret, falling back to the legacy key.
    pub async fn get_masking_secret(
        &self,
        id: &RequestId,
        strategy: &str,
        secret_type: &str,
    ) -> CacheResult<Option<Value>> {
        let legacy = format!("id-{}-masking-secret-{}-{}", id, strategy, secret_type);
        self.get_with_legacy(
            id,
            &format!("masking_secret:{}:{}", strategy, secret_type),
            &legacy,
        )
        .await
    }

    // --- async execution task id ---

    /// Records the handle of the in-flight execution task for a request.
    pub async fn set_async_execution_id(
        &self,
        id: &RequestId,
        task_id: &str,
    ) -> CacheResult<()> {
        self.set_part(id, "async_execution", &task_id, None).await
    }

    /// Reads the in-flight execution task handle, falling back to the
    /// legacy key.
    pub async fn get_async_execution_id(&self, id: &RequestId) -> CacheResult<Option<String>> {
        let legacy = format!("id-{}-async-execution", id);
        self.get_with_legacy(id, "async_execution", &legacy).await
    }

    // --- retry count ---

    /// Reads the retry count, falling back to the legacy key. Absent means
    /// zero.
    pub async fn get_retry_count(&self, id: &RequestId) -> CacheResult<u32> {
        let legacy = format!("id-{}-privacy-request-retry-count", id);
        Ok(self
            .get_with_legacy::<u32>(id, "retry_count", &legacy)
            .await?
            .unwrap_or(0))
    }

    /// Increments the retry count, returning the new value.
    pub async fn increment_retry_count(&self, id: &RequestId) -> CacheResult<u32> {
        let count = self.get_retry_count(id).await? + 1;
        self.set_part(id, "retry_count", &count, None).await?;
        Ok(count)
    }

    // --- identity verification ---

    /// Caches the identity verification code with the code TTL.
    pub async fn set_verification_code(&self, id: &RequestId, code: &str) -> CacheResult<()> {
        self.set_part(
            id,
            "verification:code",
            &code,
            Some(self.config.verification_code_ttl),
        )
        .await
    }

    /// Reads the cached verification code, if it has not expired.
    pub async fn get_verification_code(&self, id: &RequestId) -> CacheResult<Option<String>> {
        self.get_part(id, "verification:code").await
    }

    /// Reads how many verification attempts have been made. Absent means
    /// zero.
    pub async fn get_verification_attempts(&self, id: &RequestId) -> CacheResult<u32> {
        Ok(self
            .get_part::<u32>(id, "verification:attempts")
            .await?
            .unwrap_or(0))
    }

    /// Increments the verification attempt counter, returning the new value.
    pub async fn increment_verification_attempts(&self, id: &RequestId) -> CacheResult<u32> {
        let attempts = self.get_verification_attempts(id).await? + 1;
        self.set_part(id, "verification:attempts", &attempts, None)
            .await?;
        Ok(attempts)
    }

    // --- checkpoints ---

    /// Records where execution failed.
    pub async fn set_failed_checkpoint(
        &self,
        id: &RequestId,
        checkpoint: &CheckpointActionRequired,
    ) -> CacheResult<()> {
        self.set_part(id, "checkpoint:failed", checkpoint, None).await
    }

    /// Reads the failed checkpoint. Absence is a legitimate outcome, not an
    /// error.
    pub async fn get_failed_checkpoint(
        &self,
        id: &RequestId,
    ) -> CacheResult<Option<CheckpointActionRequired>> {
        self.get_part(id, "checkpoint:failed").await
    }

    /// Clears the failed checkpoint.
    pub async fn clear_failed_checkpoint(&self, id: &RequestId) -> CacheResult<()> {
        self.delete_part(id, "checkpoint:failed").await
    }

    /// Records where execution paused and what manual action is needed.
    pub async fn set_paused_checkpoint(
        &self,
        id: &RequestId,
        checkpoint: &CheckpointActionRequired,
    ) -> CacheResult<()> {
        self.set_part(id, "checkpoint:paused", checkpoint, None).await
    }

    /// Reads the paused checkpoint.
    pub async fn get_paused_checkpoint(
        &self,
        id: &RequestId,
    ) -> CacheResult<Option<CheckpointActionRequired>> {
        self.get_part(id, "checkpoint:paused").await
    }

    /// Clears the paused checkpoint.
    pub async fn clear_paused_checkpoint(&self, id: &RequestId) -> CacheResult<()> {
        self.delete_part(id, "checkpoint:paused").await
    }

    // --- manual webhook input ---

    /// Caches operator-supplied answers for one manual webhook and action.
    pub async fn set_manual_webhook_input(
        &self,
        id: &RequestId,
        connection_key: &str,
        action: ActionType,
        input: &HashMap<String, Value>,
    ) -> CacheResult<()> {
        self.set_part(
            id,
            &format!("manual_webhook:{}:{}", connection_key, action),
            input,
            None,
        )
        .await
    }

    /// Reads cached answers for one manual webhook and action.
    pub async fn get_manual_webhook_input(
        &self,
        id: &RequestId,
        connection_key: &str,
        action: ActionType,
    ) -> CacheResult<Option<HashMap<String, Value>>> {
        self.get_part(id, &format!("manual_webhook:{}:{}", connection_key, action))
            .await
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CacheResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| CacheError::Serialization(format!("failed to decode {}: {}", key, e)))
}
