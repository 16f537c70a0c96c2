//! In-memory LRU image cache bounded by footprint.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::reuse_pool::ReusePool;
use crate::domain::entities::{CacheKey, CachedImage, PixelBuffer};
use crate::infrastructure::config::FootprintMeasure;

/// Default memory cache capacity in kilobytes.
pub const DEFAULT_CACHE_SIZE_KB: usize = 1024 * 5;

struct MemoryEntry {
    image: CachedImage,
    footprint_kb: usize,
}

struct MemoryState {
    entries: LruCache<CacheKey, MemoryEntry>,
    size_kb: usize,
}

/// In-memory LRU cache for decoded images, accounted in kilobytes.
///
/// A single entry larger than the whole capacity is still admitted once the
/// cache has been emptied for it, so the capacity can be exceeded by that one
/// entry until it is evicted in turn.
pub struct MemoryImageCache {
    state: Mutex<MemoryState>,
    capacity_kb: usize,
    measure: FootprintMeasure,
    pool: Option<Arc<ReusePool>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a cache holding up to `capacity_kb` kilobytes.
    #[must_use]
    pub fn new(capacity_kb: usize, measure: FootprintMeasure, pool: Option<Arc<ReusePool>>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: LruCache::unbounded(),
                size_kb: 0,
            }),
            capacity_kb,
            measure,
            pool,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a cache with the default capacity and no reuse pool.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CACHE_SIZE_KB, FootprintMeasure::default(), None)
    }

    /// Stores an image, evicting least recently used entries until it fits.
    pub fn put(&self, key: CacheKey, image: CachedImage) {
        self.insert(key, image, true);
    }

    /// Stores `image` unless `key` is already resident.
    ///
    /// Returns the resident image: the existing entry, marked most recently
    /// used, or `image` once inserted.
    pub fn put_if_absent(&self, key: CacheKey, image: CachedImage) -> CachedImage {
        self.insert(key, image.clone(), false).unwrap_or(image)
    }

    fn insert(&self, key: CacheKey, image: CachedImage, replace: bool) -> Option<CachedImage> {
        let footprint_kb = footprint_kb(image.buffer(), self.measure);
        let mut released = Vec::new();

        {
            let mut state = self.state.lock();
            if !replace && let Some(existing) = state.entries.get(&key) {
                trace!(key = %key, "Already in memory cache, keeping resident entry");
                return Some(existing.image.clone());
            }
            if let CachedImage::Recycling(recycling) = &image {
                recycling.set_is_cached(true);
            }
            if let Some(previous) = state.entries.pop(&key) {
                state.size_kb -= previous.footprint_kb;
                if !previous.image.ptr_eq(&image) {
                    released.push(previous.image);
                }
            }
            while state.size_kb + footprint_kb > self.capacity_kb {
                let Some((evicted_key, evicted)) = state.entries.pop_lru() else {
                    break;
                };
                state.size_kb -= evicted.footprint_kb;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %evicted_key, footprint_kb = evicted.footprint_kb, "Evicted from memory cache");
                released.push(evicted.image);
            }
            if footprint_kb > self.capacity_kb {
                debug!(key = %key, footprint_kb, capacity_kb = self.capacity_kb, "Admitting oversized entry");
            }
            trace!(key = %key, footprint_kb, "Storing image in memory cache");
            state.size_kb += footprint_kb;
            state.entries.put(
                key,
                MemoryEntry {
                    image,
                    footprint_kb,
                },
            );
        }

        for image in released {
            self.release(image);
        }
        None
    }

    /// Looks up an image and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
            Some(entry.image.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<CachedImage> {
        self.state.lock().entries.peek(key).map(|entry| entry.image.clone())
    }

    /// True if `key` is resident.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Removes one entry.
    pub fn remove(&self, key: &CacheKey) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.entries.pop(key);
            if let Some(entry) = &removed {
                state.size_kb -= entry.footprint_kb;
            }
            removed
        };
        if let Some(entry) = removed {
            debug!(key = %key, "Removed image from memory cache");
            self.release(entry.image);
        }
    }

    /// Evicts every entry, releasing each one as an ordinary eviction would.
    pub fn evict_all(&self) {
        let drained: Vec<MemoryEntry> = {
            let mut state = self.state.lock();
            state.size_kb = 0;
            let mut drained = Vec::with_capacity(state.entries.len());
            while let Some((_, entry)) = state.entries.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        let count = drained.len();
        for entry in drained {
            self.release(entry.image);
        }
        debug!(count, "Memory cache cleared");
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of resident footprints in kilobytes.
    pub fn size_kb(&self) -> usize {
        self.state.lock().size_kb
    }

    /// Configured capacity in kilobytes.
    #[must_use]
    pub const fn capacity_kb(&self) -> usize {
        self.capacity_kb
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let (size, size_kb) = {
            let state = self.state.lock();
            (state.entries.len(), state.size_kb)
        };
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate,
            size,
            size_kb,
            capacity_kb: self.capacity_kb,
        }
    }

    fn release(&self, image: CachedImage) {
        match image {
            CachedImage::Recycling(recycling) => recycling.set_is_cached(false),
            CachedImage::Plain(buffer) => {
                let Some(pool) = &self.pool else {
                    return;
                };
                match Arc::try_unwrap(buffer) {
                    Ok(buffer) => pool.offer(buffer),
                    Err(_) => trace!("Evicted buffer still referenced, not pooling"),
                }
            }
        }
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Accounted size of `buffer` in kilobytes, never less than 1.
#[must_use]
pub fn footprint_kb(buffer: &PixelBuffer, measure: FootprintMeasure) -> usize {
    let bytes = match measure {
        FootprintMeasure::Allocation => buffer.allocation_byte_count(),
        FootprintMeasure::PixelBytes => buffer.byte_count(),
        FootprintMeasure::RowStride => buffer.row_stride() * buffer.height() as usize,
    };
    (bytes / 1024).max(1)
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries evicted to make room.
    pub evictions: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Current footprint in kilobytes.
    pub size_kb: usize,
    /// Capacity in kilobytes.
    pub capacity_kb: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images, {}/{} KB, {:.1}% hit rate ({} hits, {} misses, {} evictions)",
            self.size,
            self.size_kb,
            self.capacity_kb,
            self.hit_rate,
            self.hits,
            self.misses,
            self.evictions
        )
    }
}
