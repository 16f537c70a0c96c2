//! Default codec backed by the `image` crate.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{
    ColorType, DynamicImage, GrayImage, ImageDecoder, ImageError, ImageFormat, ImageReader,
    RgbImage, RgbaImage,
};
use tracing::trace;

use crate::domain::entities::{PixelBuffer, PixelFormat, ReuseRequest};
use crate::domain::ports::{CacheError, CacheResult, CompressFormat, ImageCodec, ReuseSource};

/// Decodes PNG, JPEG and WebP into RGBA buffers and encodes buffers back.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateCodec;

impl ImageCrateCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Largest power-of-two factor that keeps both sides at or above the bounds.
#[must_use]
pub fn sample_size_for(width: u32, height: u32, max_width: u32, max_height: u32) -> u32 {
    let max_width = max_width.max(1);
    let max_height = max_height.max(1);
    let mut sample = 1;
    if width > max_width || height > max_height {
        let half_width = width / 2;
        let half_height = height / 2;
        while half_width / sample >= max_width && half_height / sample >= max_height {
            sample *= 2;
        }
    }
    sample
}

impl ImageCodec for ImageCrateCodec {
    fn decode(
        &self,
        bytes: &[u8],
        max_width: u32,
        max_height: u32,
        reuse: Option<&dyn ReuseSource>,
    ) -> CacheResult<PixelBuffer> {
        let decoder = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CacheError::DecodeError(e.to_string()))?
            .into_decoder()
            .map_err(decode_error)?;
        let (width, height) = decoder.dimensions();

        let sample = sample_size_for(width, height, max_width, max_height);
        let request = ReuseRequest::new(width, height, PixelFormat::Rgba8888).with_sample_size(sample);
        let reused = reuse.and_then(|source| source.acquire_compatible(&request));

        if sample == 1 && decoder.color_type() == ColorType::Rgba8 {
            let reusing = reused.is_some();
            let mut buffer = match reused {
                Some(mut buffer) => {
                    buffer.reconfigure(width, height, PixelFormat::Rgba8888);
                    buffer
                }
                None => PixelBuffer::new(width, height, PixelFormat::Rgba8888),
            };
            decoder.read_image(buffer.pixels_mut()).map_err(decode_error)?;
            trace!(width, height, reusing, "Decoded in place");
            return Ok(buffer);
        }

        let mut decoded = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
        if sample > 1 {
            decoded = decoded.resize_exact(
                request.target_width().max(1),
                request.target_height().max(1),
                FilterType::Triangle,
            );
        }
        let rgba = decoded.into_rgba8();
        let (out_width, out_height) = rgba.dimensions();

        if let Some(mut buffer) = reused {
            buffer.reconfigure(out_width, out_height, PixelFormat::Rgba8888);
            buffer.pixels_mut().copy_from_slice(rgba.as_raw());
            trace!(width = out_width, height = out_height, sample, "Converted into reused buffer");
            return Ok(buffer);
        }

        trace!(width = out_width, height = out_height, sample, "Decoded into new buffer");
        PixelBuffer::from_raw(out_width, out_height, PixelFormat::Rgba8888, rgba.into_raw())
            .ok_or_else(|| CacheError::DecodeError("decoded pixel data is truncated".into()))
    }

    fn encode(
        &self,
        buffer: &PixelBuffer,
        format: CompressFormat,
        quality: u8,
    ) -> CacheResult<Vec<u8>> {
        let image = to_dynamic(buffer)?;
        let mut out = Cursor::new(Vec::new());

        match format {
            CompressFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = image.to_rgb8();
                JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
                    .encode_image(&rgb)
                    .map_err(|e| CacheError::EncodeError(e.to_string()))?;
            }
            CompressFormat::Png => image
                .write_to(&mut out, ImageFormat::Png)
                .map_err(|e| CacheError::EncodeError(e.to_string()))?,
            CompressFormat::Webp => {
                let image = if matches!(image, DynamicImage::ImageLuma8(_)) {
                    DynamicImage::ImageRgb8(image.to_rgb8())
                } else {
                    image
                };
                image
                    .write_to(&mut out, ImageFormat::WebP)
                    .map_err(|e| CacheError::EncodeError(e.to_string()))?;
            }
        }

        Ok(out.into_inner())
    }
}

#[allow(clippy::needless_pass_by_value)]
fn decode_error(e: ImageError) -> CacheError {
    CacheError::DecodeError(e.to_string())
}

fn to_dynamic(buffer: &PixelBuffer) -> CacheResult<DynamicImage> {
    let (width, height) = (buffer.width(), buffer.height());
    let pixels = buffer.pixels();
    let truncated = || CacheError::EncodeError("pixel data does not match dimensions".into());

    let image = match buffer.format() {
        PixelFormat::Rgba8888 => {
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, pixels.to_vec()).ok_or_else(truncated)?)
        }
        PixelFormat::Alpha8 => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, pixels.to_vec()).ok_or_else(truncated)?)
        }
        PixelFormat::Rgb565 => {
            let rgb = pixels
                .chunks_exact(2)
                .flat_map(|px| {
                    let v = u16::from_le_bytes([px[0], px[1]]);
                    [
                        expand5((v >> 11) & 0x1f),
                        expand6((v >> 5) & 0x3f),
                        expand5(v & 0x1f),
                    ]
                })
                .collect();
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, rgb).ok_or_else(truncated)?)
        }
        PixelFormat::Rgba4444 => {
            let rgba = pixels
                .chunks_exact(2)
                .flat_map(|px| {
                    let v = u16::from_le_bytes([px[0], px[1]]);
                    [
                        expand4((v >> 12) & 0xf),
                        expand4((v >> 8) & 0xf),
                        expand4((v >> 4) & 0xf),
                        expand4(v & 0xf),
                    ]
                })
                .collect();
            DynamicImage::ImageRgba8(RgbaImage::from_raw(width, height, rgba).ok_or_else(truncated)?)
        }
    };
    Ok(image)
}

#[allow(clippy::cast_possible_truncation)]
const fn expand4(v: u16) -> u8 {
    (v * 17) as u8
}

#[allow(clippy::cast_possible_truncation)]
const fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}

#[allow(clippy::cast_possible_truncation)]
const fn expand6(v: u16) -> u8 {
    ((v << 2) | (v >> 4)) as u8
}
