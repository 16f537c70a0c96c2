//! Decoded pixel buffers and the forms they take inside the memory cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Pixel layout of a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8 bits per channel, with alpha.
    #[default]
    Rgba8888,
    /// 16-bit packed RGB.
    Rgb565,
    /// 4 bits per channel, with alpha.
    Rgba4444,
    /// Single 8-bit alpha/luma channel.
    Alpha8,
}

impl PixelFormat {
    /// Bytes used by one pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgb565 | Self::Rgba4444 => 2,
            Self::Alpha8 => 1,
        }
    }
}

/// A decoded image and the allocation backing it.
///
/// The allocation may be larger than the pixels it currently holds when the
/// buffer was taken from the reuse pool and reconfigured for smaller dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl PixelBuffer {
    /// Allocates a zeroed, mutable buffer.
    #[must_use]
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let len = required_bytes(width, height, format);
        Self {
            width,
            height,
            format,
            data: vec![0; len],
            mutable: true,
        }
    }

    /// Wraps existing pixel data. Returns `None` if `data` is too short.
    #[must_use]
    pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        if data.len() < required_bytes(width, height, format) {
            return None;
        }
        Some(Self {
            width,
            height,
            format,
            data,
            mutable: true,
        })
    }

    /// Marks the buffer read-only; read-only buffers are never recycled.
    #[must_use]
    pub fn into_immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    /// Width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout.
    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    /// Whether the decoder may overwrite this buffer.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Bytes per row.
    #[must_use]
    pub fn row_stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes needed by the current dimensions and format.
    #[must_use]
    pub fn byte_count(&self) -> usize {
        required_bytes(self.width, self.height, self.format)
    }

    /// Bytes actually allocated, which may exceed [`Self::byte_count`].
    #[must_use]
    pub fn allocation_byte_count(&self) -> usize {
        self.data.capacity()
    }

    /// Pixel bytes for the current dimensions.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.data[..self.byte_count()]
    }

    /// Mutable pixel bytes for the current dimensions.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        let len = self.byte_count();
        &mut self.data[..len]
    }

    /// Reshapes the buffer in place, keeping the allocation when it is large enough.
    ///
    /// Returns `true` if no reallocation was needed.
    pub fn reconfigure(&mut self, width: u32, height: u32, format: PixelFormat) -> bool {
        let needed = required_bytes(width, height, format);
        let fits = needed <= self.data.capacity();
        self.data.clear();
        self.data.resize(needed, 0);
        self.width = width;
        self.height = height;
        self.format = format;
        fits
    }
}

fn required_bytes(width: u32, height: u32, format: PixelFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

/// A buffer that tracks whether it is still cached and still on screen.
///
/// Holders use this to learn that the memory cache already let go of it.
#[derive(Debug)]
pub struct RecyclingBuffer {
    buffer: PixelBuffer,
    cached: AtomicBool,
    display_refs: AtomicUsize,
}

impl RecyclingBuffer {
    /// Wraps a buffer; it starts out neither cached nor displayed.
    #[must_use]
    pub const fn new(buffer: PixelBuffer) -> Self {
        Self {
            buffer,
            cached: AtomicBool::new(false),
            display_refs: AtomicUsize::new(0),
        }
    }

    /// The wrapped pixels.
    #[must_use]
    pub const fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    /// Records insertion into or removal from the memory cache.
    pub fn set_is_cached(&self, cached: bool) {
        self.cached.store(cached, Ordering::Release);
    }

    /// True while the memory cache holds this buffer.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    /// Records a view starting or stopping to display this buffer.
    pub fn set_is_displayed(&self, displayed: bool) {
        if displayed {
            self.display_refs.fetch_add(1, Ordering::AcqRel);
        } else {
            let _ = self
                .display_refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    /// Number of views currently displaying this buffer.
    #[must_use]
    pub fn display_count(&self) -> usize {
        self.display_refs.load(Ordering::Acquire)
    }

    /// True once neither the cache nor any view references the buffer.
    #[must_use]
    pub fn is_released(&self) -> bool {
        !self.is_cached() && self.display_count() == 0
    }
}

/// A decoded image as stored in the memory cache.
#[derive(Debug, Clone)]
pub enum CachedImage {
    /// Evicted buffers go to the reuse pool when nobody else holds them.
    Plain(Arc<PixelBuffer>),
    /// Evicted buffers are flagged "no longer cached" and left to their holders.
    Recycling(Arc<RecyclingBuffer>),
}

impl CachedImage {
    /// Wraps a freshly decoded buffer.
    #[must_use]
    pub fn plain(buffer: PixelBuffer) -> Self {
        Self::Plain(Arc::new(buffer))
    }

    /// Wraps a buffer whose holders track display state.
    #[must_use]
    pub fn recycling(buffer: PixelBuffer) -> Self {
        Self::Recycling(Arc::new(RecyclingBuffer::new(buffer)))
    }

    /// The pixels, regardless of variant.
    #[must_use]
    pub fn buffer(&self) -> &PixelBuffer {
        match self {
            Self::Plain(buffer) => buffer,
            Self::Recycling(recycling) => recycling.buffer(),
        }
    }

    /// True if both values share one allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Plain(a), Self::Plain(b)) => Arc::ptr_eq(a, b),
            (Self::Recycling(a), Self::Recycling(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Describes the buffer a decoder is about to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseRequest {
    /// Source width before subsampling.
    pub width: u32,
    /// Source height before subsampling.
    pub height: u32,
    /// Format of the decoded output.
    pub format: PixelFormat,
    /// Power-of-two downsampling factor; 1 means full size.
    pub sample_size: u32,
}

impl ReuseRequest {
    /// Request for a full-size decode.
    #[must_use]
    pub const fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            sample_size: 1,
        }
    }

    /// Sets the subsampling factor (clamped to at least 1).
    #[must_use]
    pub const fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = if sample_size == 0 { 1 } else { sample_size };
        self
    }

    /// Output width after subsampling.
    #[must_use]
    pub const fn target_width(&self) -> u32 {
        self.width / self.sample_size
    }

    /// Output height after subsampling.
    #[must_use]
    pub const fn target_height(&self) -> u32 {
        self.height / self.sample_size
    }

    /// Bytes the decoded output will need.
    #[must_use]
    pub fn target_byte_count(&self) -> usize {
        required_bytes(self.target_width(), self.target_height(), self.format)
    }
}
