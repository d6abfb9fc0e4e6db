//! Dense pixel arrays.
//!
//! A [`PixelArray`] holds `(height, width, bands)` samples in row-major,
//! band-interleaved order. Samples are stored as `f64`, which represents every
//! supported [`DType`] exactly; the dtype tag decides how samples are clamped,
//! persisted and encoded.

use std::fmt;
use std::str::FromStr;

use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use serde::{Deserialize, Serialize};

// =============================================================================
// DType
// =============================================================================

/// Sample data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl DType {
    pub const fn as_str(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Size of one sample on disk.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Uint16 | DType::Int16 => 2,
            DType::Uint32 | DType::Int32 | DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Representable range.
    pub fn range(self) -> (f64, f64) {
        match self {
            DType::Uint8 => (0.0, u8::MAX as f64),
            DType::Uint16 => (0.0, u16::MAX as f64),
            DType::Uint32 => (0.0, u32::MAX as f64),
            DType::Int8 => (i8::MIN as f64, i8::MAX as f64),
            DType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            DType::Float64 => (f64::MIN, f64::MAX),
        }
    }

    /// Bring a value into the representable set of this dtype.
    pub fn coerce(self, value: f64) -> f64 {
        let (min, max) = self.range();
        match self {
            DType::Float64 => value,
            DType::Float32 => value as f32 as f64,
            _ if value.is_nan() => 0.0,
            _ => value.round().clamp(min, max),
        }
    }

    /// Append one little-endian sample.
    pub(crate) fn write_sample(self, value: f64, out: &mut Vec<u8>) {
        let value = self.coerce(value);
        match self {
            DType::Uint8 => out.push(value as u8),
            DType::Int8 => out.push(value as i8 as u8),
            DType::Uint16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            DType::Int16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            DType::Uint32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            DType::Int32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DType::Float32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DType::Float64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Read one sample; `bytes` must hold at least `bytes_per_sample()`.
    pub(crate) fn read_sample(self, bytes: &[u8], little_endian: bool) -> f64 {
        macro_rules! read {
            ($ty:ty, $n:expr) => {{
                let mut buf = [0u8; $n];
                buf.copy_from_slice(&bytes[..$n]);
                if little_endian {
                    <$ty>::from_le_bytes(buf) as f64
                } else {
                    <$ty>::from_be_bytes(buf) as f64
                }
            }};
        }
        match self {
            DType::Uint8 => bytes[0] as f64,
            DType::Int8 => bytes[0] as i8 as f64,
            DType::Uint16 => read!(u16, 2),
            DType::Int16 => read!(i16, 2),
            DType::Uint32 => read!(u32, 4),
            DType::Int32 => read!(i32, 4),
            DType::Float32 => read!(f32, 4),
            DType::Float64 => read!(f64, 8),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint8" => Ok(DType::Uint8),
            "uint16" => Ok(DType::Uint16),
            "uint32" => Ok(DType::Uint32),
            "int8" => Ok(DType::Int8),
            "int16" => Ok(DType::Int16),
            "int32" => Ok(DType::Int32),
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            other => Err(format!("unknown dtype {other:?}")),
        }
    }
}

// =============================================================================
// Mask
// =============================================================================

/// Per-pixel write mask; `true` pixels are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: usize,
    height: usize,
    data: Vec<bool>,
}

impl Mask {
    pub fn new(width: usize, height: usize, fill: bool) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    /// The mask clipped or padded with `false` to `width` x `height`.
    pub fn resized(&self, width: usize, height: usize) -> Mask {
        Mask::from_fn(width, height, |x, y| x < self.width && y < self.height && self.get(x, y))
    }

    /// Set the `width` x `height` block at `(x, y)`, limited to the pixels
    /// `within` marks when given. The block is clipped to the mask.
    pub fn cover(&mut self, x: usize, y: usize, width: usize, height: usize, within: Option<&Mask>) {
        let w = width.min(self.width.saturating_sub(x));
        let h = height.min(self.height.saturating_sub(y));
        for sy in 0..h {
            for sx in 0..w {
                if within.map_or(true, |m| m.get(sx, sy)) {
                    self.data[(y + sy) * self.width + x + sx] = true;
                }
            }
        }
    }
}

// =============================================================================
// PixelArray
// =============================================================================

/// A dense `(height, width, bands)` block of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelArray {
    width: usize,
    height: usize,
    bands: usize,
    dtype: DType,
    data: Vec<f64>,
}

impl PixelArray {
    /// A zero-filled array.
    pub fn new(width: usize, height: usize, bands: usize, dtype: DType) -> Self {
        Self {
            width,
            height,
            bands,
            dtype,
            data: vec![0.0; width * height * bands],
        }
    }

    /// Build from interleaved samples; `None` if the length does not match.
    pub fn from_samples(
        width: usize,
        height: usize,
        bands: usize,
        dtype: DType,
        data: Vec<f64>,
    ) -> Option<Self> {
        (data.len() == width * height * bands).then_some(Self {
            width,
            height,
            bands,
            dtype,
            data,
        })
    }

    /// Build by evaluating `f(x, y, band)` for every sample.
    pub fn from_fn(
        width: usize,
        height: usize,
        bands: usize,
        dtype: DType,
        f: impl Fn(usize, usize, usize) -> f64,
    ) -> Self {
        let mut data = Vec::with_capacity(width * height * bands);
        for y in 0..height {
            for x in 0..width {
                for b in 0..bands {
                    data.push(dtype.coerce(f(x, y, b)));
                }
            }
        }
        Self {
            width,
            height,
            bands,
            dtype,
            data,
        }
    }

    /// Decode packed samples as stored in files.
    pub fn from_bytes(
        width: usize,
        height: usize,
        bands: usize,
        dtype: DType,
        bytes: &[u8],
        little_endian: bool,
    ) -> Option<Self> {
        let step = dtype.bytes_per_sample();
        let count = width * height * bands;
        if bytes.len() < count * step {
            return None;
        }
        let data = bytes
            .chunks_exact(step)
            .take(count)
            .map(|chunk| dtype.read_sample(chunk, little_endian))
            .collect();
        Some(Self {
            width,
            height,
            bands,
            dtype,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn samples(&self) -> &[f64] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Estimated in-memory cost in bytes.
    pub fn byte_cost(&self) -> usize {
        self.data.len() * std::mem::size_of::<f64>()
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        (y * self.width + x) * self.bands
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, band: usize) -> f64 {
        self.data[self.index(x, y) + band]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, band: usize, value: f64) {
        let i = self.index(x, y) + band;
        self.data[i] = self.dtype.coerce(value);
    }

    /// All bands of one pixel.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[f64] {
        let i = self.index(x, y);
        &self.data[i..i + self.bands]
    }

    /// Copy of a sub-rectangle, clipped to the array bounds.
    pub fn crop(&self, left: usize, top: usize, width: usize, height: usize) -> PixelArray {
        let left = left.min(self.width);
        let top = top.min(self.height);
        let width = width.min(self.width - left);
        let height = height.min(self.height - top);
        let mut out = PixelArray::new(width, height, self.bands, self.dtype);
        let row = width * self.bands;
        for y in 0..height {
            let src = self.index(left, top + y);
            let dst = y * row;
            out.data[dst..dst + row].copy_from_slice(&self.data[src..src + row]);
        }
        out
    }

    /// Copy into a canvas of a new size, padding with zeros or truncating.
    pub fn resized_canvas(&self, width: usize, height: usize) -> PixelArray {
        let mut out = PixelArray::new(width, height, self.bands, self.dtype);
        out.blit(self, 0, 0, None);
        out
    }

    /// Write `src` with its top-left corner at `(x, y)`.
    ///
    /// Pixels falling outside this array are dropped. With a mask, only
    /// pixels whose mask value is `true` overwrite existing samples. Band
    /// counts must match.
    pub fn blit(&mut self, src: &PixelArray, x: usize, y: usize, mask: Option<&Mask>) {
        debug_assert_eq!(self.bands, src.bands);
        if x >= self.width || y >= self.height {
            return;
        }
        let w = src.width.min(self.width - x);
        let h = src.height.min(self.height - y);
        let bands = self.bands;
        for sy in 0..h {
            match mask {
                None => {
                    let s = src.index(0, sy);
                    let d = self.index(x, y + sy);
                    self.data[d..d + w * bands].copy_from_slice(&src.data[s..s + w * bands]);
                }
                Some(mask) => {
                    for sx in 0..w {
                        if mask.get(sx, sy) {
                            let s = src.index(sx, sy);
                            let d = self.index(x + sx, y + sy);
                            self.data[d..d + bands].copy_from_slice(&src.data[s..s + bands]);
                        }
                    }
                }
            }
        }
    }

    /// Keep only the listed bands, in the given order.
    ///
    /// Returns `None` if an index is out of range.
    pub fn select_bands(&self, bands: &[usize]) -> Option<PixelArray> {
        if bands.iter().any(|&b| b >= self.bands) {
            return None;
        }
        let mut data = Vec::with_capacity(self.width * self.height * bands.len());
        for px in self.data.chunks_exact(self.bands.max(1)) {
            data.extend(bands.iter().map(|&b| px[b]));
        }
        Some(PixelArray {
            width: self.width,
            height: self.height,
            bands: bands.len(),
            dtype: self.dtype,
            data,
        })
    }

    /// Pack samples little-endian as `dtype` values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() * self.dtype.bytes_per_sample());
        for &v in &self.data {
            self.dtype.write_sample(v, &mut out);
        }
        out
    }

    /// Convert for PNG/JPEG encoding.
    ///
    /// `uint16` arrays become 16-bit images, everything else is clamped to
    /// 8 bits. One band is grey, two grey+alpha, three RGB, four or more RGBA
    /// (extra bands dropped).
    pub fn to_dynamic_image(&self) -> DynamicImage {
        let (w, h) = (self.width as u32, self.height as u32);
        let channels = self.bands.clamp(1, 4);
        let take = |v: &[f64]| -> Vec<f64> {
            let mut out = Vec::with_capacity(self.width * self.height * channels);
            for px in v.chunks_exact(self.bands.max(1)) {
                for c in 0..channels {
                    out.push(px.get(c).copied().unwrap_or(0.0));
                }
            }
            out
        };
        let samples = if self.bands == 0 {
            vec![0.0; self.width * self.height]
        } else {
            take(&self.data)
        };

        if self.dtype == DType::Uint16 {
            let raw: Vec<u16> = samples.iter().map(|v| v.round().clamp(0.0, 65535.0) as u16).collect();
            return match channels {
                1 => ImageBuffer::<Luma<u16>, _>::from_raw(w, h, raw).map(DynamicImage::ImageLuma16),
                2 => ImageBuffer::<LumaA<u16>, _>::from_raw(w, h, raw).map(DynamicImage::ImageLumaA16),
                3 => ImageBuffer::<Rgb<u16>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgb16),
                _ => ImageBuffer::<Rgba<u16>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgba16),
            }
            .unwrap_or_else(|| DynamicImage::new_luma16(w, h));
        }

        let raw: Vec<u8> = samples.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
        match channels {
            1 => ImageBuffer::<Luma<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::<LumaA<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
            _ => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
        }
        .unwrap_or_else(|| DynamicImage::new_luma8(w, h))
    }

    /// Convert a decoded image; 16-bit images keep their depth.
    pub fn from_dynamic_image(img: &DynamicImage) -> PixelArray {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let color = img.color();
        let channels = color.channel_count() as usize;
        let sixteen = color.bytes_per_pixel() as usize == channels * 2;

        let (data, dtype): (Vec<f64>, DType) = match (channels, sixteen) {
            (1, false) => (to_f64(img.to_luma8().into_raw()), DType::Uint8),
            (2, false) => (to_f64(img.to_luma_alpha8().into_raw()), DType::Uint8),
            (3, false) => (to_f64(img.to_rgb8().into_raw()), DType::Uint8),
            (_, false) => (to_f64(img.to_rgba8().into_raw()), DType::Uint8),
            (1, true) => (to_f64(img.to_luma16().into_raw()), DType::Uint16),
            (2, true) => (to_f64(img.to_luma_alpha16().into_raw()), DType::Uint16),
            (3, true) => (to_f64(img.to_rgb16().into_raw()), DType::Uint16),
            (_, true) => (to_f64(img.to_rgba16().into_raw()), DType::Uint16),
        };
        let bands = channels.min(4);
        PixelArray {
            width: w,
            height: h,
            bands,
            dtype,
            data,
        }
    }
}

fn to_f64<T: Into<f64>>(raw: Vec<T>) -> Vec<f64> {
    raw.into_iter().map(Into::into).collect()
}

// =============================================================================
// Tests
// =============================================================================
