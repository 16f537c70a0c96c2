//! Infrastructure layer with storage, codec and configuration adapters.

/// Application configuration.
pub mod config;
/// Image caching (memory tier, disk tier, buffer reuse).
pub mod image;

pub use config::{AppConfig, CacheConfig, CliArgs, LogLevel, StorageManager};
pub use image::{
    CacheStats, DiskCacheCoordinator, DiskPhase, FileJournalStore, FileStoreOpener, ImageCache,
    ImageCacheComponents, ImageCrateCodec, MemoryImageCache, ReusePool, SysinfoSpaceProbe,
};
