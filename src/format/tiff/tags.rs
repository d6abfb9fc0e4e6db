//! TIFF tag, field type and code tables.
//!
//! Only the vocabulary needed to read tiled pyramids and write the
//! engine's own output is defined here.

use crate::array::DType;

// =============================================================================
// Field types
// =============================================================================

/// Encoding of the values of an IFD entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    Byte = 1,
    Ascii = 2,
    Short = 3,
    Long = 4,
    Rational = 5,
    Undefined = 7,
    SShort = 8,
    SLong = 9,
    Float = 11,
    Double = 12,
    /// BigTIFF only
    Long8 = 16,
}

impl FieldType {
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte | FieldType::Ascii | FieldType::Undefined => 1,
            FieldType::Short | FieldType::SShort => 2,
            FieldType::Long | FieldType::SLong | FieldType::Float => 4,
            FieldType::Rational | FieldType::Double | FieldType::Long8 => 8,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => FieldType::Byte,
            2 => FieldType::Ascii,
            3 => FieldType::Short,
            4 => FieldType::Long,
            5 => FieldType::Rational,
            7 => FieldType::Undefined,
            8 => FieldType::SShort,
            9 => FieldType::SLong,
            11 => FieldType::Float,
            12 => FieldType::Double,
            16 => FieldType::Long8,
            _ => return None,
        })
    }
}

// =============================================================================
// Tags
// =============================================================================

/// Tags the reader and writer understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffTag {
    NewSubfileType = 254,
    ImageWidth = 256,
    ImageLength = 257,
    BitsPerSample = 258,
    Compression = 259,
    PhotometricInterpretation = 262,
    ImageDescription = 270,
    StripOffsets = 273,
    SamplesPerPixel = 277,
    RowsPerStrip = 278,
    StripByteCounts = 279,
    XResolution = 282,
    YResolution = 283,
    PlanarConfiguration = 284,
    ResolutionUnit = 296,
    Software = 305,
    TileWidth = 322,
    TileLength = 323,
    TileOffsets = 324,
    TileByteCounts = 325,
    ExtraSamples = 338,
    SampleFormat = 339,
    JpegTables = 347,
}

impl TiffTag {
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    pub const fn name(self) -> &'static str {
        match self {
            TiffTag::NewSubfileType => "NewSubfileType",
            TiffTag::ImageWidth => "ImageWidth",
            TiffTag::ImageLength => "ImageLength",
            TiffTag::BitsPerSample => "BitsPerSample",
            TiffTag::Compression => "Compression",
            TiffTag::PhotometricInterpretation => "PhotometricInterpretation",
            TiffTag::ImageDescription => "ImageDescription",
            TiffTag::StripOffsets => "StripOffsets",
            TiffTag::SamplesPerPixel => "SamplesPerPixel",
            TiffTag::RowsPerStrip => "RowsPerStrip",
            TiffTag::StripByteCounts => "StripByteCounts",
            TiffTag::XResolution => "XResolution",
            TiffTag::YResolution => "YResolution",
            TiffTag::PlanarConfiguration => "PlanarConfiguration",
            TiffTag::ResolutionUnit => "ResolutionUnit",
            TiffTag::Software => "Software",
            TiffTag::TileWidth => "TileWidth",
            TiffTag::TileLength => "TileLength",
            TiffTag::TileOffsets => "TileOffsets",
            TiffTag::TileByteCounts => "TileByteCounts",
            TiffTag::ExtraSamples => "ExtraSamples",
            TiffTag::SampleFormat => "SampleFormat",
            TiffTag::JpegTables => "JPEGTables",
        }
    }
}

// =============================================================================
// Code tables
// =============================================================================

/// Compression schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    /// Modern JPEG (TIFF 6.0 technote 2)
    Jpeg,
    Deflate,
    Jpeg2000,
    Other(u16),
}

impl Compression {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Compression::None,
            5 => Compression::Lzw,
            7 => Compression::Jpeg,
            8 | 32946 => Compression::Deflate,
            33003 | 33005 | 34712 => Compression::Jpeg2000,
            other => Compression::Other(other),
        }
    }

    pub const fn as_u16(self) -> u16 {
        match self {
            Compression::None => 1,
            Compression::Lzw => 5,
            Compression::Jpeg => 7,
            Compression::Deflate => 8,
            Compression::Jpeg2000 => 33003,
            Compression::Other(value) => value,
        }
    }

    /// Whether tiles with this compression can be decoded.
    pub const fn is_supported(self) -> bool {
        matches!(self, Compression::None | Compression::Jpeg)
    }

    pub fn name(self) -> String {
        match self {
            Compression::None => "none".into(),
            Compression::Lzw => "LZW".into(),
            Compression::Jpeg => "JPEG".into(),
            Compression::Deflate => "Deflate".into(),
            Compression::Jpeg2000 => "JPEG 2000".into(),
            Compression::Other(value) => format!("unknown ({value})"),
        }
    }
}

/// `SampleFormat` codes.
pub const SAMPLE_FORMAT_UINT: u16 = 1;
pub const SAMPLE_FORMAT_INT: u16 = 2;
pub const SAMPLE_FORMAT_FLOAT: u16 = 3;

/// `PhotometricInterpretation` codes.
pub const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
pub const PHOTOMETRIC_RGB: u16 = 2;

/// `NewSubfileType` bit marking a reduced-resolution image.
pub const SUBFILE_REDUCED_IMAGE: u32 = 1;

/// Sample type from `BitsPerSample` and `SampleFormat`.
pub fn dtype_for(bits: u16, sample_format: u16) -> Option<DType> {
    Some(match (sample_format, bits) {
        (SAMPLE_FORMAT_UINT, 8) => DType::Uint8,
        (SAMPLE_FORMAT_UINT, 16) => DType::Uint16,
        (SAMPLE_FORMAT_UINT, 32) => DType::Uint32,
        (SAMPLE_FORMAT_INT, 8) => DType::Int8,
        (SAMPLE_FORMAT_INT, 16) => DType::Int16,
        (SAMPLE_FORMAT_INT, 32) => DType::Int32,
        (SAMPLE_FORMAT_FLOAT, 32) => DType::Float32,
        (SAMPLE_FORMAT_FLOAT, 64) => DType::Float64,
        _ => return None,
    })
}

/// `(BitsPerSample, SampleFormat)` of a sample type.
pub fn tiff_sample_type(dtype: DType) -> (u16, u16) {
    let bits = (dtype.bytes_per_sample() * 8) as u16;
    let format = match dtype {
        DType::Uint8 | DType::Uint16 | DType::Uint32 => SAMPLE_FORMAT_UINT,
        DType::Int8 | DType::Int16 | DType::Int32 => SAMPLE_FORMAT_INT,
        DType::Float32 | DType::Float64 => SAMPLE_FORMAT_FLOAT,
    };
    (bits, format)
}
