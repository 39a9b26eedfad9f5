//! The seam between raw bytes and decoded payloads.
//!
//! The caching and fetching layers never look inside a payload. They only need to know how much
//! memory it occupies, and they hand out its original size so consumers can decide on further
//! transforms. A [`Decoder`] is injected into the [`CacheCoordinator`](crate::caching::CacheCoordinator)
//! and is called exactly once per fetched or disk-loaded blob.

use image::imageops::FilterType;
use image::{GenericImageView, RgbaImage};

use crate::caching::{CacheContents, CacheError};
use crate::types::Dimensions;

/// A decoded value that can be held in the [`MemoryStore`](crate::caching::MemoryStore).
pub trait Payload: Send + Sync + 'static {
    /// The decoded footprint of this payload in bytes.
    fn weight(&self) -> u64;

    /// The full-resolution size of the resource this payload was decoded from, if known.
    fn original_dimensions(&self) -> Option<Dimensions> {
        None
    }
}

/// Turns fetched bytes into a [`Payload`].
///
/// Decoding may be slow and is always run on a blocking thread.
pub trait Decoder: Send + Sync + 'static {
    type Item: Payload;

    /// Decodes `data`, possibly scaled down towards `size_hint`.
    ///
    /// Failures should be reported as [`CacheError::Malformed`].
    fn decode(&self, data: &[u8], size_hint: Option<Dimensions>) -> CacheContents<Self::Item>;
}

/// A decoded RGBA bitmap.
#[derive(Debug, Clone)]
pub struct Image {
    pixels: RgbaImage,
    original: Dimensions,
}

impl Image {
    pub fn new(pixels: RgbaImage, original: Dimensions) -> Self {
        Self { pixels, original }
    }

    /// The size of the decoded bitmap.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.pixels.width(), self.pixels.height())
    }

    /// The size of the encoded source image, before any downscaling.
    pub fn original(&self) -> Dimensions {
        self.original
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }
}

impl Payload for Image {
    fn weight(&self) -> u64 {
        self.pixels.as_raw().len() as u64
    }

    fn original_dimensions(&self) -> Option<Dimensions> {
        Some(self.original)
    }
}

/// Decodes PNG, JPEG, GIF and WebP images into RGBA bitmaps.
///
/// With a size hint, the image is downscaled by the largest power of two that keeps both sides
/// above the hinted size. Exact resizing is left to the consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl Decoder for ImageDecoder {
    type Item = Image;

    fn decode(&self, data: &[u8], size_hint: Option<Dimensions>) -> CacheContents<Image> {
        let image =
            image::load_from_memory(data).map_err(|e| CacheError::Malformed(e.to_string()))?;
        let (width, height) = image.dimensions();
        let original = Dimensions::new(width, height);

        let scale = size_hint.map_or(1, |hint| sample_size(original, hint));
        let image = if scale > 1 {
            image.resize_exact(width / scale, height / scale, FilterType::Triangle)
        } else {
            image
        };

        tracing::trace!(%original, scale, "Decoded image");
        Ok(Image::new(image.into_rgba8(), original))
    }
}

/// Picks a power-of-two downscale factor for decoding `original` towards `target`.
fn sample_size(original: Dimensions, target: Dimensions) -> u32 {
    let mut scale = 1;
    if original.width > target.width || original.height > target.height {
        let half_width = original.width / 2;
        let half_height = original.height / 2;
        while half_width / scale > target.width && half_height / scale > target.height {
            scale *= 2;
        }
    }
    scale
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba};

    use super::*;

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let pixels = RgbaImage::from_pixel(width, height, Rgba([200, 10, 10, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(pixels)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_sample_size() {
        let original = Dimensions::new(1024, 768);
        assert_eq!(sample_size(original, Dimensions::new(2048, 2048)), 1);
        assert_eq!(sample_size(original, Dimensions::new(1024, 768)), 1);
        assert_eq!(sample_size(original, Dimensions::new(300, 200)), 2);
        assert_eq!(sample_size(original, Dimensions::new(100, 100)), 4);
        // the side closest to its target bounds the scale
        assert_eq!(sample_size(original, Dimensions::new(10, 300)), 2);
    }

    #[test]
    fn test_decode_full_size() {
        let image = ImageDecoder.decode(&encode_png(64, 32), None).unwrap();

        assert_eq!(image.dimensions(), Dimensions::new(64, 32));
        assert_eq!(image.original(), Dimensions::new(64, 32));
        assert_eq!(image.weight(), 64 * 32 * 4);
        assert_eq!(image.pixels().get_pixel(0, 0), &Rgba([200, 10, 10, 255]));
    }

    #[test]
    fn test_decode_downscaled() {
        let hint = Dimensions::hint(16, 8);
        let image = ImageDecoder.decode(&encode_png(64, 32), hint).unwrap();

        assert_eq!(image.dimensions(), Dimensions::new(32, 16));
        assert_eq!(image.original_dimensions(), Some(Dimensions::new(64, 32)));
    }

    #[test]
    fn test_decode_garbage() {
        let result = ImageDecoder.decode(b"definitely not an image", None);
        assert!(matches!(result, Err(CacheError::Malformed(_))));
    }
}
