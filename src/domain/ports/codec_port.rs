//! Port definitions for decoding, encoding and buffer reuse.

use serde::{Deserialize, Serialize};

use super::image_cache_port::CacheResult;
use crate::domain::entities::{PixelBuffer, ReuseRequest};

/// Compression used when writing to the disk tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressFormat {
    /// Lossy, honours the quality setting.
    #[default]
    Jpeg,
    /// Lossless.
    Png,
    /// Lossless WebP.
    Webp,
}

impl std::fmt::Display for CompressFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jpeg => write!(f, "jpeg"),
            Self::Png => write!(f, "png"),
            Self::Webp => write!(f, "webp"),
        }
    }
}

/// Source of previously allocated buffers a decoder may overwrite.
pub trait ReuseSource: Send + Sync {
    /// Removes and returns a buffer able to hold the requested output.
    fn acquire_compatible(&self, request: &ReuseRequest) -> Option<PixelBuffer>;
}

/// Decodes compressed bytes into pixel buffers and back.
///
/// Both methods are CPU-bound and are called from the blocking pool.
pub trait ImageCodec: Send + Sync {
    /// Decodes `bytes`, downsampling so the result fits `max_width` x `max_height`.
    ///
    /// # Errors
    /// Returns `CacheError::DecodeError` if the bytes are not a supported image.
    fn decode(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        reuse: Option<&dyn ReuseSource>,
    ) -> CacheResult<PixelBuffer>;

    /// Encodes `buffer` with the given format and quality (0-100).
    ///
    /// # Errors
    /// Returns `CacheError::EncodeError` if the buffer cannot be encoded.
    fn encode(&self, buffer: &PixelBuffer, format: CompressFormat, quality: u8)
    -> CacheResult<Vec<u8>>;
}
