//! TIFF reading and writing.
//!
//! - **Byte order**: files declare their endianness (II = little-endian,
//!   MM = big-endian) in the header; every multi-byte value is read in it.
//!
//! - **Classic TIFF vs BigTIFF**: classic files use 32-bit offsets, BigTIFF
//!   64-bit ones. Reading handles both; writing produces classic files.
//!
//! - **IFDs**: each image file directory describes one image. Pyramids keep
//!   one directory per level and frame, next to label, macro and thumbnail
//!   images.

mod parser;
mod reader;
mod tags;
mod writer;

pub use parser::{ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE};
pub use reader::{is_tiff_header, TiffFactory, TiffSource};
pub use tags::{Compression, FieldType, TiffTag};
pub use writer::TiffEncoder;
