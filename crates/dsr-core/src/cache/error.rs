//! Cache error types.

use thiserror::Error;

/// Errors that can occur during cache operations.
///
/// Backend unavailability is fatal and propagated; logical misses are never
/// errors (they surface as `Ok(None)` from reads).
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Failed to connect to the cache backend.
    #[error("cache connection failed: {0}")]
    Connection(String),

    /// Failed to serialize or deserialize a cached value.
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// A backend command failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
