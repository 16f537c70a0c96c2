//! Port definition for image caching.

use crate::domain::entities::{CacheKey, CachedImage};

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to decode image.
    #[error("Decode error: {0}")]
    DecodeError(String),
    /// Failed to encode image.
    #[error("Encode error: {0}")]
    EncodeError(String),
    /// Not enough free space on the cache volume.
    #[error("Insufficient space: {available} bytes available, more than {required} required")]
    InsufficientSpace {
        /// Usable bytes reported for the volume.
        available: u64,
        /// Configured disk cache capacity.
        required: u64,
    },
    /// A decode or encode task was cancelled or panicked.
    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Port for image caching operations.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Attempts to get an image from the cache.
    /// Returns None if no tier holds it.
    async fn get(&self, key: &CacheKey) -> Option<CachedImage>;

    /// Stores an image in the cache.
    async fn put(&self, key: CacheKey, image: CachedImage);

    /// Clears all tiers.
    async fn clear(&self);

    /// Persists pending state to durable storage.
    async fn flush(&self);

    /// Releases durable storage handles.
    async fn close(&self);
}
