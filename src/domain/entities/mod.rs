//! Domain entity definitions.

mod cache_key;
mod image;
mod pixel_buffer;

pub use cache_key::{CacheKey, DiskDigest, SizeClass};
pub use image::{ImageSource, LoadedImage};
pub use pixel_buffer::{CachedImage, PixelBuffer, PixelFormat, RecyclingBuffer, ReuseRequest};
