//! Results handed back to the fetch/decode pipeline.

use super::{CacheKey, CachedImage};

/// An image found in one of the cache tiers.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// The key that was looked up.
    pub key: CacheKey,
    /// The decoded image.
    pub image: CachedImage,
    /// The tier that answered.
    pub source: ImageSource,
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from the in-memory LRU cache.
    MemoryCache,
    /// Decoded from the disk cache and promoted into memory.
    DiskCache,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
        }
    }
}
