//! Downsampling and resizing of pixel arrays.
//!
//! Pyramid levels are derived with [`downsample_2x`], which aggregates each
//! 2x2 block of the finer level. Region output uses [`resize`], which
//! aggregates the (possibly fractional) block of source pixels behind each
//! output pixel, or samples the nearest pixel when enlarging.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::array::PixelArray;

/// How a block of source pixels collapses into one output pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleMethod {
    /// Top-left pixel of the block
    Nearest,
    /// Per-band mean
    #[default]
    Mean,
    /// Per-band median
    Median,
    /// Per-band most frequent value (smallest on ties)
    Mode,
    /// Per-band minimum
    Min,
    /// Per-band maximum
    Max,
    /// Whole pixel with the largest band sum
    MaxColor,
    /// Whole pixel with the smallest band sum
    MinColor,
}

impl ResampleMethod {
    pub const ALL: [ResampleMethod; 8] = [
        ResampleMethod::Nearest,
        ResampleMethod::Mean,
        ResampleMethod::Median,
        ResampleMethod::Mode,
        ResampleMethod::Min,
        ResampleMethod::Max,
        ResampleMethod::MaxColor,
        ResampleMethod::MinColor,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResampleMethod::Nearest => "nearest",
            ResampleMethod::Mean => "mean",
            ResampleMethod::Median => "median",
            ResampleMethod::Mode => "mode",
            ResampleMethod::Min => "min",
            ResampleMethod::Max => "max",
            ResampleMethod::MaxColor => "max_color",
            ResampleMethod::MinColor => "min_color",
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResampleMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown resample method {s:?}"))
    }
}

// =============================================================================
// Aggregation
// =============================================================================

fn aggregate(src: &PixelArray, xs: (usize, usize), ys: (usize, usize), method: ResampleMethod, out: &mut [f64]) {
    let bands = src.bands();
    match method {
        ResampleMethod::Nearest => out.copy_from_slice(src.pixel(xs.0, ys.0)),
        ResampleMethod::MaxColor | ResampleMethod::MinColor => {
            let mut best: Option<(f64, (usize, usize))> = None;
            for y in ys.0..ys.1 {
                for x in xs.0..xs.1 {
                    let sum: f64 = src.pixel(x, y).iter().sum();
                    let better = match best {
                        None => true,
                        Some((b, _)) if method == ResampleMethod::MaxColor => sum > b,
                        Some((b, _)) => sum < b,
                    };
                    if better {
                        best = Some((sum, (x, y)));
                    }
                }
            }
            if let Some((_, (x, y))) = best {
                out.copy_from_slice(src.pixel(x, y));
            }
        }
        _ => {
            let mut values = Vec::with_capacity((xs.1 - xs.0) * (ys.1 - ys.0));
            for (band, slot) in out.iter_mut().enumerate().take(bands) {
                values.clear();
                for y in ys.0..ys.1 {
                    for x in xs.0..xs.1 {
                        values.push(src.get(x, y, band));
                    }
                }
                *slot = reduce(&mut values, method);
            }
        }
    }
}

fn reduce(values: &mut [f64], method: ResampleMethod) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match method {
        ResampleMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
        ResampleMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        ResampleMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ResampleMethod::Median => {
            values.sort_by(f64::total_cmp);
            let n = values.len();
            if n % 2 == 1 {
                values[n / 2]
            } else {
                (values[n / 2 - 1] + values[n / 2]) / 2.0
            }
        }
        ResampleMethod::Mode => {
            values.sort_by(f64::total_cmp);
            let mut best = values[0];
            let mut best_run = 0;
            let mut i = 0;
            while i < values.len() {
                let mut j = i;
                while j < values.len() && values[j].total_cmp(&values[i]) == Ordering::Equal {
                    j += 1;
                }
                if j - i > best_run {
                    best_run = j - i;
                    best = values[i];
                }
                i = j;
            }
            best
        }
        _ => values[0],
    }
}

// =============================================================================
// Public API
// =============================================================================

/// Halve each spatial dimension (floor, at least one pixel).
///
/// Output pixel `(x, y)` aggregates source pixels `2x..2x+2` by `2y..2y+2`,
/// clipped to the source for one-pixel-wide inputs.
pub fn downsample_2x(src: &PixelArray, method: ResampleMethod) -> PixelArray {
    let width = (src.width() / 2).max(1);
    let height = (src.height() / 2).max(1);
    let bands = src.bands();
    let mut out = PixelArray::new(width, height, bands, src.dtype());
    if src.is_empty() {
        return PixelArray::new(0, 0, bands, src.dtype());
    }
    let mut px = vec![0.0; bands];
    for y in 0..height {
        let ys = (2 * y, (2 * y + 2).min(src.height()));
        for x in 0..width {
            let xs = (2 * x, (2 * x + 2).min(src.width()));
            aggregate(src, xs, ys, method, &mut px);
            for (b, &v) in px.iter().enumerate() {
                out.set(x, y, b, v);
            }
        }
    }
    out
}

/// Resize to `width` x `height`.
///
/// Shrinking aggregates the covering source block with `method`;
/// enlarging samples the nearest source pixel.
pub fn resize(src: &PixelArray, width: usize, height: usize, method: ResampleMethod) -> PixelArray {
    if width == src.width() && height == src.height() {
        return src.clone();
    }
    let bands = src.bands();
    let mut out = PixelArray::new(width, height, bands, src.dtype());
    if src.is_empty() || width == 0 || height == 0 {
        return out;
    }
    let sx = src.width() as f64 / width as f64;
    let sy = src.height() as f64 / height as f64;
    let span = |o: usize, scale: f64, limit: usize| -> (usize, usize) {
        let start = ((o as f64 * scale).floor() as usize).min(limit - 1);
        let end = (((o + 1) as f64 * scale).ceil() as usize).clamp(start + 1, limit);
        if scale <= 1.0 {
            (start, start + 1)
        } else {
            (start, end)
        }
    };
    let mut px = vec![0.0; bands];
    for y in 0..height {
        let ys = span(y, sy, src.height());
        for x in 0..width {
            let xs = span(x, sx, src.width());
            aggregate(src, xs, ys, method, &mut px);
            for (b, &v) in px.iter().enumerate() {
                out.set(x, y, b, v);
            }
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
