//! Domain layer with cache identities, pixel buffers and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CachedImage, DiskDigest, PixelBuffer, PixelFormat, SizeClass};
pub use errors::StoreError;
pub use ports::{CacheError, ImageCachePort, JournaledStore, StoreOpener};
