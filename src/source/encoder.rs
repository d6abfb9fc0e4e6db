//! PNG/JPEG encoding of pixel arrays.
//!
//! JPEG carries at most three 8-bit channels, so alpha and extra bands are
//! dropped and 16-bit data is reduced before encoding. PNG keeps 16-bit
//! depth and alpha.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use super::Encoding;
use crate::array::PixelArray;
use crate::error::TileError;
use crate::format::jpeg::frame_components;

/// Minimum allowed JPEG quality.
pub const MIN_JPEG_QUALITY: u8 = 1;

/// Maximum allowed JPEG quality.
pub const MAX_JPEG_QUALITY: u8 = 100;

/// Encode an array with the requested compression.
pub fn encode_array(array: &PixelArray, encoding: Encoding) -> Result<Bytes, TileError> {
    if array.is_empty() {
        return Ok(Bytes::new());
    }
    let image = array.to_dynamic_image();
    match encoding {
        Encoding::Png => encode_png(&image),
        Encoding::Jpeg { quality } => encode_jpeg(&image, quality),
    }
}

fn encode_png(image: &DynamicImage) -> Result<Bytes, TileError> {
    let mut output = Cursor::new(Vec::new());
    image
        .write_to(&mut output, ImageFormat::Png)
        .map_err(|e| TileError::Encode {
            message: e.to_string(),
        })?;
    Ok(Bytes::from(output.into_inner()))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Bytes, TileError> {
    let quality = quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY);
    let flattened = if image.color().has_color() {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        DynamicImage::ImageLuma8(image.to_luma8())
    };

    let mut output = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality);
    encoder
        .encode_image(&flattened)
        .map_err(|e| TileError::Encode {
            message: e.to_string(),
        })?;
    Ok(Bytes::from(output))
}

/// Decode PNG or JPEG bytes back into an array (format sniffed).
///
/// A single-component JPEG decodes to one band even when the decoder
/// expands it to RGB.
pub fn decode_image(data: &[u8]) -> Result<PixelArray, TileError> {
    let image = image::load_from_memory(data).map_err(|e| TileError::SourceDecode {
        message: e.to_string(),
    })?;
    let array = PixelArray::from_dynamic_image(&image);
    if array.bands() > 1 && frame_components(data) == Some(1) {
        return Ok(array.select_bands(&[0]).unwrap_or(array));
    }
    Ok(array)
}
