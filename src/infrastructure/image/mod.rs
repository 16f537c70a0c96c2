//! Image caching infrastructure.
//!
//! This module provides:
//! - Memory caching with footprint-bounded LRU eviction
//! - A reuse pool of evicted buffers for the decoder
//! - A coordinated disk tier over a journaled file store
//! - The tiered cache facade

pub mod codec;
pub mod disk_cache;
pub mod file_store;
pub mod image_cache;
pub mod memory_cache;
pub mod reuse_pool;
pub mod space;

pub use codec::{ImageCrateCodec, sample_size_for};
pub use disk_cache::{DiskCacheCoordinator, DiskPhase, DiskWriteOutcome};
pub use file_store::{FileJournalStore, FileStoreOpener};
pub use image_cache::{ImageCache, ImageCacheComponents, PENDING_WRITE_LIMIT};
pub use memory_cache::{CacheStats, MemoryImageCache, footprint_kb};
pub use reuse_pool::{PoolStats, ReusePool, can_reuse};
pub use space::SysinfoSpaceProbe;
