use thiserror::Error;

/// I/O errors that can occur when reading or writing image files
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File or directory not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other filesystem or network failure
    #[error("I/O failure on {path}: {message}")]
    Other { path: String, message: String },
}

impl IoError {
    pub(crate) fn from_std(path: impl Into<String>, err: std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(path)
        } else {
            IoError::Other {
                path,
                message: err.to_string(),
            }
        }
    }
}

/// Errors that can occur when parsing TIFF files
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42 (TIFF) or 43 (BigTIFF), got {0}")]
    InvalidVersion(u16),

    /// Invalid BigTIFF offset byte size (must be 8)
    #[error("Invalid BigTIFF offset byte size: expected 8, got {0}")]
    InvalidBigTiffOffsetSize(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unsupported compression scheme
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// File uses strips instead of tiles
    #[error("Unsupported organization: file uses strips instead of tiles")]
    StripOrganization,

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// The file would exceed what classic TIFF offsets can address
    #[error("Output too large for classic TIFF: {0} bytes")]
    TooLarge(u64),
}

/// Errors raised by the scale algebra
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScaleError {
    /// Unit token is not one of pixels, fraction, mm, mag_pixels, base_pixels
    #[error("Invalid units: {0:?}")]
    InvalidUnits(String),

    /// Conversion needs calibration the source does not provide
    #[error("Missing calibration: {0}")]
    MissingCalibration(&'static str),
}

/// Errors related to format detection and on-disk containers
#[derive(Debug, Clone, Error)]
pub enum FormatError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF parsing error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// File format is recognized but not supported
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// No registered backend claims the file
    #[error("No source can read {path}")]
    NoReader { path: String },

    /// Directory store or archive is malformed
    #[error("Store error: {0}")]
    Store(String),
}

/// Errors raised by the tile cache backends
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Networked backend could not be reached or misbehaved
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    /// Value could not be serialized for a remote backend
    #[error("Cache serialization failed: {0}")]
    Serialization(String),
}

/// Errors that can occur while reading tiles or regions from a source
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Tile address outside the level's tile grid or frame range
    #[error(
        "Tile out of range: level {level}, ({x}, {y}), frame {frame} \
         (grid {max_x}x{max_y}, {frames} frames)"
    )]
    OutOfRange {
        level: u32,
        x: u32,
        y: u32,
        frame: usize,
        max_x: u32,
        max_y: u32,
        frames: usize,
    },

    /// Requested pyramid level does not exist
    #[error("Invalid level {level}: source has {levels} levels")]
    InvalidLevel { level: u32, levels: u32 },

    /// Band index outside the source's band count
    #[error("Invalid band {band}: source has {bands} bands")]
    InvalidBand { band: usize, bands: usize },

    /// An explicit region was supplied together with a scale pair
    #[error("Mutually exclusive arguments: {0}")]
    MutuallyExclusiveArguments(String),

    /// The decoder could not produce pixels
    #[error("Source decode error: {message}")]
    SourceDecode { message: String },

    /// Encoding the payload (PNG/JPEG) failed
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Scale conversion failed
    #[error("Scale error: {0}")]
    Scale(#[from] ScaleError),

    /// Format-level failure
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// TIFF structure error
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// Cache backend failure that could not be degraded to a miss
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Errors raised by the pyramid sink
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// Band count of a write disagrees with the sink
    #[error("Shape mismatch: sink has {expected} bands, write has {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Data type of a write disagrees with the sink
    #[error("Dtype mismatch: sink is {expected}, write is {actual}")]
    DtypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Mask does not match the tile's spatial shape
    #[error("Mask shape {mask_width}x{mask_height} does not match tile {width}x{height}")]
    MaskMismatch {
        width: usize,
        height: usize,
        mask_width: usize,
        mask_height: usize,
    },

    /// Nothing has been written yet
    #[error("Sink is empty")]
    EmptySink,

    /// Linear frame index outside the sink's frame space
    #[error("Invalid frame {frame}: sink has {frames} frames")]
    InvalidFrame { frame: usize, frames: usize },

    /// Region could not be resolved
    #[error("Scale error: {0}")]
    Scale(#[from] ScaleError),

    /// No encoder for the destination
    #[error("Unsupported destination: {0}")]
    UnsupportedDestination(String),

    /// Encoder failure
    #[error("Encode error: {0}")]
    Encode(String),

    /// Format failure
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    /// TIFF writer failure
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Reading the tiles being copied failed
    #[error("Source error: {0}")]
    Source(#[from] TileError),
}
