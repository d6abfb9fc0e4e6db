//! Scale and unit conversion algebra.
//!
//! Regions, points and scales can be expressed in several unit systems:
//!
//! - **base_pixels**: pixels of the full-resolution image
//! - **mag_pixels**: pixels at a requested magnification / mm-per-pixel
//! - **pixels**: `mag_pixels` when a scale is supplied, `base_pixels` otherwise
//! - **fraction**: fraction of the full image width or height
//! - **mm**: physical millimetres, via the source's mm-per-pixel calibration
//!
//! Every conversion goes through base-pixel space. All functions here are
//! pure; the only state they read is a source's [`Calibration`].
//!
//! # Level numbering
//!
//! Source levels are numbered from the coarsest (`0`) to the native
//! resolution (`levels - 1`), so the level for a magnification is
//! `max_level + log2(requested / native)`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScaleError;

// =============================================================================
// Units
// =============================================================================

/// Unit system of a region, point or output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    /// Pixels at the supplied scale (or base pixels without one)
    #[default]
    Pixels,
    /// Fraction of the full image size
    Fraction,
    /// Millimetres
    Mm,
    /// Pixels at the supplied magnification
    MagPixels,
    /// Pixels of the full-resolution image
    BasePixels,
}

impl Units {
    /// Token used in serialized descriptors.
    pub const fn as_str(self) -> &'static str {
        match self {
            Units::Pixels => "pixels",
            Units::Fraction => "fraction",
            Units::Mm => "mm",
            Units::MagPixels => "mag_pixels",
            Units::BasePixels => "base_pixels",
        }
    }

    fn is_pixel_like(self) -> bool {
        matches!(self, Units::Pixels | Units::MagPixels | Units::BasePixels)
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Units {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pixels" | "pixel" => Ok(Units::Pixels),
            "fraction" => Ok(Units::Fraction),
            "mm" | "millimeters" | "millimetres" => Ok(Units::Mm),
            "mag_pixels" => Ok(Units::MagPixels),
            "base_pixels" => Ok(Units::BasePixels),
            other => Err(ScaleError::InvalidUnits(other.to_string())),
        }
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// A requested scale.
///
/// All fields `None` means the native resolution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScaleDescriptor {
    /// Objective magnification (e.g. 20.0)
    pub magnification: Option<f64>,
    /// Millimetres per pixel horizontally
    pub mm_x: Option<f64>,
    /// Millimetres per pixel vertically
    pub mm_y: Option<f64>,
    /// Refuse results that would need resampling between levels
    #[serde(default)]
    pub exact: bool,
}

impl ScaleDescriptor {
    /// Scale at a magnification.
    pub fn magnification(magnification: f64) -> Self {
        Self {
            magnification: Some(magnification),
            ..Default::default()
        }
    }

    /// Scale at a physical resolution.
    pub fn mm(mm_x: f64, mm_y: Option<f64>) -> Self {
        Self {
            mm_x: Some(mm_x),
            mm_y,
            ..Default::default()
        }
    }

    /// Same scale, requiring an exact native level.
    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }

    /// Whether no scale component is set.
    pub fn is_native(&self) -> bool {
        self.magnification.is_none() && self.mm_x.is_none() && self.mm_y.is_none()
    }
}

/// A rectangle in some unit system.
///
/// Any two of `left`/`right`/`width` determine the horizontal extent (and
/// likewise vertically). Missing values default to the full image.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub left: Option<f64>,
    pub top: Option<f64>,
    pub right: Option<f64>,
    pub bottom: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    #[serde(default)]
    pub units: Units,
}

impl RegionDescriptor {
    /// The whole image.
    pub fn full() -> Self {
        Self::default()
    }

    /// Origin plus size form.
    pub fn rect(left: f64, top: f64, width: f64, height: f64, units: Units) -> Self {
        Self {
            left: Some(left),
            top: Some(top),
            width: Some(width),
            height: Some(height),
            units,
            ..Default::default()
        }
    }

    /// Size only, anchored at the origin.
    pub fn size(width: f64, height: f64, units: Units) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            units,
            ..Default::default()
        }
    }

    /// A single point (used by pixel queries).
    pub fn point(left: f64, top: f64, units: Units) -> Self {
        Self {
            left: Some(left),
            top: Some(top),
            units,
            ..Default::default()
        }
    }

    pub fn with_right(mut self, right: f64) -> Self {
        self.right = Some(right);
        self
    }

    pub fn with_bottom(mut self, bottom: f64) -> Self {
        self.bottom = Some(bottom);
        self
    }

    /// Resolve to a base-pixel rectangle.
    ///
    /// The result is not clipped to the image.
    pub fn to_base_rect(
        &self,
        calibration: &Calibration,
        source_scale: Option<&ScaleDescriptor>,
    ) -> Result<Rect, ScaleError> {
        let (fx, fy) = calibration.scale_factors(source_scale)?;
        let axis_x = calibration.axis_x();
        let axis_y = calibration.axis_y();

        let conv_x = |v: Option<f64>| -> Result<Option<f64>, ScaleError> {
            v.map(|v| axis_x.to_base(v, self.units, fx)).transpose()
        };
        let conv_y = |v: Option<f64>| -> Result<Option<f64>, ScaleError> {
            v.map(|v| axis_y.to_base(v, self.units, fy)).transpose()
        };

        let (left, width) = resolve_span(
            conv_x(self.left)?,
            conv_x(self.right)?,
            conv_x(self.width)?,
            calibration.size_x as f64,
        );
        let (top, height) = resolve_span(
            conv_y(self.top)?,
            conv_y(self.bottom)?,
            conv_y(self.height)?,
            calibration.size_y as f64,
        );

        Ok(Rect {
            left,
            top,
            width,
            height,
        })
    }
}

fn resolve_span(start: Option<f64>, end: Option<f64>, size: Option<f64>, full: f64) -> (f64, f64) {
    match (start, end, size) {
        (Some(s), Some(e), _) => (s, e - s),
        (Some(s), None, Some(w)) => (s, w),
        (None, Some(e), Some(w)) => (e - w, w),
        (Some(s), None, None) => (s, full - s),
        (None, Some(e), None) => (0.0, e),
        (None, None, Some(w)) => (0.0, w),
        (None, None, None) => (0.0, full),
    }
}

/// A real-valued rectangle in base pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    /// Clip to `[0, size_x] x [0, size_y]`.
    pub fn clip(&self, size_x: f64, size_y: f64) -> Rect {
        let left = self.left.clamp(0.0, size_x);
        let top = self.top.clamp(0.0, size_y);
        let right = self.right().clamp(left, size_x);
        let bottom = self.bottom().clamp(top, size_y);
        Rect {
            left,
            top,
            width: right - left,
            height: bottom - top,
        }
    }
}

// =============================================================================
// Calibration
// =============================================================================

/// Everything the algebra needs to know about a source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Full-resolution width in pixels
    pub size_x: u32,
    /// Full-resolution height in pixels
    pub size_y: u32,
    /// Number of pyramid levels
    pub levels: u32,
    /// Native magnification, if known
    pub magnification: Option<f64>,
    /// Native mm per pixel horizontally, if known
    pub mm_x: Option<f64>,
    /// Native mm per pixel vertically, if known
    pub mm_y: Option<f64>,
}

/// Magnification details for one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagnificationInfo {
    pub magnification: Option<f64>,
    pub mm_x: Option<f64>,
    pub mm_y: Option<f64>,
    pub level: u32,
    /// Downsample factor relative to the native level
    pub scale: f64,
}

#[derive(Debug, Clone, Copy)]
struct AxisCalibration {
    size: f64,
    mm: Option<f64>,
}

impl AxisCalibration {
    fn to_base(&self, value: f64, units: Units, factor: f64) -> Result<f64, ScaleError> {
        match units {
            Units::BasePixels => Ok(value),
            Units::Pixels | Units::MagPixels => Ok(value * factor),
            Units::Fraction => Ok(value * self.size),
            Units::Mm => self
                .mm
                .map(|mm| value / mm)
                .ok_or(ScaleError::MissingCalibration("mm per pixel")),
        }
    }

    fn from_base(&self, value: f64, units: Units, factor: f64) -> Result<f64, ScaleError> {
        match units {
            Units::BasePixels => Ok(value),
            Units::Pixels | Units::MagPixels => Ok(value / factor),
            Units::Fraction => Ok(if self.size > 0.0 {
                value / self.size
            } else {
                0.0
            }),
            Units::Mm => self
                .mm
                .map(|mm| value * mm)
                .ok_or(ScaleError::MissingCalibration("mm per pixel")),
        }
    }
}

impl Calibration {
    /// Calibration for an image without physical metadata.
    pub fn uncalibrated(size_x: u32, size_y: u32, levels: u32) -> Self {
        Self {
            size_x,
            size_y,
            levels,
            magnification: None,
            mm_x: None,
            mm_y: None,
        }
    }

    /// Index of the native (full-resolution) level.
    pub fn max_level(&self) -> u32 {
        self.levels.saturating_sub(1)
    }

    fn axis_x(&self) -> AxisCalibration {
        AxisCalibration {
            size: self.size_x as f64,
            mm: self.mm_x,
        }
    }

    fn axis_y(&self) -> AxisCalibration {
        AxisCalibration {
            size: self.size_y as f64,
            mm: self.mm_y.or(self.mm_x),
        }
    }

    /// Base pixels per scaled pixel along x and y.
    ///
    /// A missing or native scale yields `(1.0, 1.0)`.
    pub fn scale_factors(&self, scale: Option<&ScaleDescriptor>) -> Result<(f64, f64), ScaleError> {
        let Some(scale) = scale else {
            return Ok((1.0, 1.0));
        };
        if let Some(mag) = scale.magnification {
            let native = self
                .magnification
                .ok_or(ScaleError::MissingCalibration("native magnification"))?;
            let factor = native / mag;
            return Ok((factor, factor));
        }
        if scale.mm_x.is_some() || scale.mm_y.is_some() {
            let native_x = self
                .mm_x
                .ok_or(ScaleError::MissingCalibration("mm per pixel"))?;
            let native_y = self.mm_y.unwrap_or(native_x);
            let req_x = scale.mm_x.or(scale.mm_y).unwrap_or(native_x);
            let req_y = scale.mm_y.unwrap_or(req_x);
            return Ok((req_x / native_x, req_y / native_y));
        }
        Ok((1.0, 1.0))
    }

    /// Magnification details of a level (the native level when `None`).
    pub fn magnification_for_level(&self, level: Option<u32>) -> MagnificationInfo {
        let max_level = self.max_level();
        let level = level.unwrap_or(max_level);
        let scale = 2f64.powi(max_level as i32 - level as i32);
        MagnificationInfo {
            magnification: self.magnification.map(|m| m / scale),
            mm_x: self.mm_x.map(|mm| mm * scale),
            mm_y: self.mm_y.map(|mm| mm * scale),
            level,
            scale,
        }
    }
}

// =============================================================================
// Level selection
// =============================================================================

/// How a continuous ideal level is turned into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelRounding {
    /// Nearest level, ties to even
    #[default]
    Round,
    /// Next finer-or-equal level; `None` past the native level
    Ceil,
    /// The real-valued level, clamped to the pyramid
    Fractional,
    /// The real-valued level, unclamped
    Unbounded,
}

fn round4(value: f64) -> f64 {
    (value * 1e4).round() / 1e4
}

/// Level matching a magnification and/or mm-per-pixel request.
///
/// Each supplied quantity contributes `log2` of its ratio to the native
/// value; the ideal level is the native level plus their mean. Returns the
/// native level when nothing is requested, and `None` when `exact` is set
/// and no native level matches or when `Ceil` would exceed the native level.
pub fn level_for_magnification(
    calibration: &Calibration,
    scale: &ScaleDescriptor,
    rounding: LevelRounding,
) -> Option<f64> {
    let max_level = calibration.max_level() as f64;

    let mut ratios = Vec::with_capacity(3);
    if let (Some(requested), Some(native)) = (scale.magnification, calibration.magnification) {
        if requested > 0.0 && native > 0.0 {
            ratios.push(requested / native);
        }
    }
    if let (Some(requested), Some(native)) = (scale.mm_x, calibration.mm_x) {
        if requested > 0.0 && native > 0.0 {
            ratios.push(native / requested);
        }
    }
    if let (Some(requested), Some(native)) = (scale.mm_y, calibration.mm_y.or(calibration.mm_x)) {
        if requested > 0.0 && native > 0.0 {
            ratios.push(native / requested);
        }
    }

    let ratios: Vec<f64> = ratios.iter().map(|r| round4(r.log2())).collect();
    let Some(&first) = ratios.first() else {
        return Some(max_level);
    };

    if scale.exact && ratios.iter().any(|&r| r.fract() != 0.0 || r != first) {
        return None;
    }

    let mean = round4(ratios.iter().sum::<f64>() / ratios.len() as f64);
    let mut level = max_level + mean;
    level = match rounding {
        LevelRounding::Round => level.round_ties_even(),
        LevelRounding::Ceil => level.ceil(),
        LevelRounding::Fractional | LevelRounding::Unbounded => level,
    };

    if (scale.exact && (level > max_level || level < 0.0))
        || (rounding == LevelRounding::Ceil && level > max_level)
    {
        return None;
    }
    if rounding != LevelRounding::Unbounded {
        level = level.clamp(0.0, max_level);
    }
    Some(level)
}

// =============================================================================
// Region and point conversion
// =============================================================================

fn output_units(target_units: Option<Units>, target_scale: Option<&ScaleDescriptor>) -> Units {
    match target_units {
        None => Units::BasePixels,
        Some(Units::Pixels) => match target_scale {
            Some(scale) if !scale.is_native() => Units::MagPixels,
            _ => Units::BasePixels,
        },
        Some(units) => units,
    }
}

/// Convert a region between unit systems and scales.
///
/// A region not in `pixels` is returned unchanged when neither a target
/// scale nor target units are requested. The result is expressed as
/// left/top/width/height.
pub fn convert_region(
    calibration: &Calibration,
    region: &RegionDescriptor,
    source_scale: Option<&ScaleDescriptor>,
    target_scale: Option<&ScaleDescriptor>,
    target_units: Option<Units>,
) -> Result<RegionDescriptor, ScaleError> {
    if region.units != Units::Pixels && target_scale.is_none() && target_units.is_none() {
        return Ok(*region);
    }

    let base = region.to_base_rect(calibration, source_scale)?;
    let units = output_units(target_units, target_scale);
    let (fx, fy) = calibration.scale_factors(target_scale)?;
    let axis_x = calibration.axis_x();
    let axis_y = calibration.axis_y();

    Ok(RegionDescriptor {
        left: Some(axis_x.from_base(base.left, units, fx)?),
        top: Some(axis_y.from_base(base.top, units, fy)?),
        right: None,
        bottom: None,
        width: Some(axis_x.from_base(base.width, units, fx)?),
        height: Some(axis_y.from_base(base.height, units, fy)?),
        units,
    })
}

/// Convert a single point between unit systems and scales.
pub fn point_at_another_scale(
    calibration: &Calibration,
    point: (f64, f64),
    source_scale: Option<&ScaleDescriptor>,
    source_units: Units,
    target_scale: Option<&ScaleDescriptor>,
    target_units: Units,
) -> Result<(f64, f64), ScaleError> {
    let (sfx, sfy) = calibration.scale_factors(source_scale)?;
    let (tfx, tfy) = calibration.scale_factors(target_scale)?;
    let axis_x = calibration.axis_x();
    let axis_y = calibration.axis_y();

    let base_x = axis_x.to_base(point.0, source_units, sfx)?;
    let base_y = axis_y.to_base(point.1, source_units, sfy)?;
    Ok((
        axis_x.from_base(base_x, target_units, tfx)?,
        axis_y.from_base(base_y, target_units, tfy)?,
    ))
}

/// Whether the units can be passed straight to a pixel query.
pub(crate) fn is_pixel_units(units: Units) -> bool {
    units.is_pixel_like()
}

// =============================================================================
// Tests
// =============================================================================
