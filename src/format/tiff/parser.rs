//! TIFF header, IFD and value parsing.
//!
//! # Layout
//!
//! ```text
//! Classic: "II"|"MM", 42, u32 first IFD
//! BigTIFF: "II"|"MM", 43, 8, 0, u64 first IFD
//!
//! IFD:     count, count x entry, next IFD offset
//! Entry:   u16 tag, u16 type, count, value-or-offset
//! ```
//!
//! Values that fit in the entry's value field (4 bytes classic, 8 BigTIFF)
//! are stored inline; anything larger lives at the offset. Only the header,
//! the IFDs and the arrays actually requested are read.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use super::tags::{FieldType, TiffTag};
use crate::error::TiffError;
use crate::io::{read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, RangeReader};

const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;
const VERSION_TIFF: u16 = 42;
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

/// Upper bound on IFDs followed in one chain.
const MAX_IFDS: usize = 4096;

/// Upper bound on entries in one IFD.
const MAX_ENTRIES: u64 = 4096;

// =============================================================================
// ByteOrder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::LittleEndian => read_u64_le(bytes),
            ByteOrder::BigEndian => read_u64_be(bytes),
        }
    }

    pub fn is_little_endian(self) -> bool {
        self == ByteOrder::LittleEndian
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    pub byte_order: ByteOrder,
    pub is_bigtiff: bool,
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse the header from the first 8 (classic) or 16 (BigTIFF) bytes.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let (is_bigtiff, first_ifd_offset) = match byte_order.read_u16(&bytes[2..4]) {
            VERSION_TIFF => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            version => return Err(TiffError::InvalidVersion(version)),
        };

        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }
        Ok(Self {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    /// Read and parse the header of a file.
    pub async fn read(reader: &dyn RangeReader) -> Result<Self, TiffError> {
        let len = (BIGTIFF_HEADER_SIZE as u64).min(reader.size()) as usize;
        let bytes = reader.read_exact_at(0, len).await?;
        Self::parse(&bytes, reader.size())
    }

    /// Bytes per IFD entry.
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Bytes of the entry count at the start of an IFD.
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Bytes of offsets (next IFD, value offsets).
    #[inline]
    pub const fn offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }

    fn read_offset(&self, bytes: &[u8]) -> u64 {
        if self.is_bigtiff {
            self.byte_order.read_u64(bytes)
        } else {
            self.byte_order.read_u32(bytes) as u64
        }
    }
}

// =============================================================================
// IFD entries
// =============================================================================

/// One directory entry, with its value field kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    pub tag: u16,
    /// `None` for field types this parser does not know
    pub field_type: Option<FieldType>,
    pub count: u64,
    /// The raw value field (inline value or offset), zero padded to 8 bytes
    value_field: [u8; 8],
}

impl IfdEntry {
    /// Total bytes of the entry's values.
    pub fn byte_len(&self) -> Option<u64> {
        self.field_type
            .map(|t| t.size_in_bytes() as u64)
            .and_then(|size| size.checked_mul(self.count))
    }

    fn is_inline(&self, header: &TiffHeader) -> bool {
        self.byte_len()
            .is_some_and(|len| len <= header.offset_size() as u64)
    }

    fn offset(&self, header: &TiffHeader) -> u64 {
        header.read_offset(&self.value_field)
    }

    /// Raw value bytes, read from the file when not inline.
    pub async fn read_bytes(&self, reader: &dyn RangeReader, header: &TiffHeader) -> Result<Bytes, TiffError> {
        let len = self.byte_len().ok_or(TiffError::InvalidTagValue {
            tag: "entry",
            message: format!("tag {} has unsupported field type", self.tag),
        })?;
        if self.is_inline(header) {
            return Ok(Bytes::copy_from_slice(&self.value_field[..len as usize]));
        }
        let len = usize::try_from(len).map_err(|_| TiffError::InvalidTagValue {
            tag: "entry",
            message: format!("tag {} value too large", self.tag),
        })?;
        Ok(reader.read_exact_at(self.offset(header), len).await?)
    }

    /// Values as unsigned integers (Byte, Short, Long, Long8).
    pub async fn read_uints(&self, reader: &dyn RangeReader, header: &TiffHeader) -> Result<Vec<u64>, TiffError> {
        let bytes = self.read_bytes(reader, header).await?;
        parse_uints(&bytes, self.field_type, header.byte_order).ok_or(TiffError::InvalidTagValue {
            tag: "entry",
            message: format!("tag {} is not an unsigned integer array", self.tag),
        })
    }

    /// First value as an unsigned integer, inline entries only.
    pub fn inline_uint(&self, header: &TiffHeader) -> Option<u64> {
        if self.count == 0 || !self.is_inline(header) {
            return None;
        }
        let size = self.field_type?.size_in_bytes();
        parse_uints(&self.value_field[..size], self.field_type, header.byte_order)?
            .first()
            .copied()
    }

    /// Value as text, trimmed at the first NUL.
    pub async fn read_string(&self, reader: &dyn RangeReader, header: &TiffHeader) -> Result<String, TiffError> {
        let bytes = self.read_bytes(reader, header).await?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// First Rational as a float.
    pub async fn read_rational(&self, reader: &dyn RangeReader, header: &TiffHeader) -> Result<Option<f64>, TiffError> {
        if self.field_type != Some(FieldType::Rational) || self.count == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(reader, header).await?;
        let num = header.byte_order.read_u32(&bytes[0..4]) as f64;
        let den = header.byte_order.read_u32(&bytes[4..8]) as f64;
        Ok((den != 0.0).then_some(num / den))
    }
}

/// Decode unsigned integer values of a given field type.
pub fn parse_uints(bytes: &[u8], field_type: Option<FieldType>, order: ByteOrder) -> Option<Vec<u64>> {
    let values = match field_type? {
        FieldType::Byte | FieldType::Undefined => bytes.iter().map(|&b| b as u64).collect(),
        FieldType::Short => bytes.chunks_exact(2).map(|c| order.read_u16(c) as u64).collect(),
        FieldType::Long => bytes.chunks_exact(4).map(|c| order.read_u32(c) as u64).collect(),
        FieldType::Long8 => bytes.chunks_exact(8).map(|c| order.read_u64(c)).collect(),
        _ => return None,
    };
    Some(values)
}

// =============================================================================
// IFDs
// =============================================================================

/// One image file directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    pub offset: u64,
    pub entries: HashMap<u16, IfdEntry>,
    pub next_offset: u64,
}

impl Ifd {
    /// Read the IFD at `offset`.
    pub async fn read(reader: &dyn RangeReader, header: &TiffHeader, offset: u64) -> Result<Self, TiffError> {
        let size = reader.size();
        let count_size = header.ifd_count_size();
        if offset.saturating_add(count_size as u64) > size {
            return Err(TiffError::InvalidIfdOffset(offset));
        }
        let count_bytes = reader.read_exact_at(offset, count_size).await?;
        let count = if header.is_bigtiff {
            header.byte_order.read_u64(&count_bytes)
        } else {
            header.byte_order.read_u16(&count_bytes) as u64
        };
        if count > MAX_ENTRIES {
            return Err(TiffError::InvalidTagValue {
                tag: "IFD",
                message: format!("{count} entries at offset {offset}"),
            });
        }

        let entry_size = header.ifd_entry_size();
        let body_len = count as usize * entry_size + header.offset_size();
        let body_start = offset + count_size as u64;
        if body_start.saturating_add(body_len as u64) > size {
            return Err(TiffError::InvalidIfdOffset(offset));
        }
        let body = reader.read_exact_at(body_start, body_len).await?;

        let order = header.byte_order;
        let mut entries = HashMap::with_capacity(count as usize);
        for raw in body[..count as usize * entry_size].chunks_exact(entry_size) {
            let tag = order.read_u16(&raw[0..2]);
            let field_type = FieldType::from_u16(order.read_u16(&raw[2..4]));
            let (count, value) = if header.is_bigtiff {
                (order.read_u64(&raw[4..12]), &raw[12..20])
            } else {
                (order.read_u32(&raw[4..8]) as u64, &raw[8..12])
            };
            let mut value_field = [0u8; 8];
            value_field[..value.len()].copy_from_slice(value);
            entries.insert(
                tag,
                IfdEntry {
                    tag,
                    field_type,
                    count,
                    value_field,
                },
            );
        }
        let next_offset = header.read_offset(&body[count as usize * entry_size..]);

        Ok(Self {
            offset,
            entries,
            next_offset,
        })
    }

    /// Follow the IFD chain from the header.
    ///
    /// Stops at a zero offset; loops and runaway chains are rejected.
    pub async fn read_chain(reader: &dyn RangeReader, header: &TiffHeader) -> Result<Vec<Self>, TiffError> {
        let mut ifds = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = header.first_ifd_offset;
        while offset != 0 {
            if !seen.insert(offset) || ifds.len() >= MAX_IFDS {
                return Err(TiffError::InvalidIfdOffset(offset));
            }
            let ifd = Self::read(reader, header, offset).await?;
            offset = ifd.next_offset;
            ifds.push(ifd);
        }
        Ok(ifds)
    }

    pub fn entry(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.entries.get(&tag.as_u16())
    }

    /// Inline integer value of a tag, or `default` when absent.
    pub fn uint_or(&self, header: &TiffHeader, tag: TiffTag, default: u64) -> u64 {
        self.entry(tag)
            .and_then(|e| e.inline_uint(header))
            .unwrap_or(default)
    }

    /// Inline integer value of a required tag.
    pub fn require_uint(&self, header: &TiffHeader, tag: TiffTag) -> Result<u64, TiffError> {
        let entry = self.entry(tag).ok_or(TiffError::MissingTag(tag.name()))?;
        entry.inline_uint(header).ok_or(TiffError::InvalidTagValue {
            tag: tag.name(),
            message: "expected a single integer".into(),
        })
    }

    pub fn is_tiled(&self) -> bool {
        self.entry(TiffTag::TileWidth).is_some() && self.entry(TiffTag::TileOffsets).is_some()
    }
}
