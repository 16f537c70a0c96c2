mod codec_port;
mod image_cache_port;
mod journaled_store_port;
mod space_probe_port;

pub use codec_port::{CompressFormat, ImageCodec, ReuseSource};
pub use image_cache_port::{CacheError, CacheResult, ImageCachePort};
pub use journaled_store_port::{Editor, JournaledStore, Snapshot, StoreOpener};
pub use space_probe_port::SpaceProbe;
