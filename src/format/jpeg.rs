//! JPEG-compressed TIFF blocks.
//!
//! Tiled TIFFs commonly store JPEG blocks as abbreviated streams: each block
//! omits its quantization (DQT) and Huffman (DHT) tables, which are stored
//! once in the directory's `JPEGTables` tag. Before decoding, the tables are
//! spliced in: tables without their trailing EOI, then the block without its
//! leading SOI.

use bytes::{Bytes, BytesMut};

use crate::array::PixelArray;
use crate::error::TileError;
use crate::source::encoder::decode_image;

// =============================================================================
// Markers
// =============================================================================

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const EOI: [u8; 2] = [0xFF, 0xD9];
pub const DHT: [u8; 2] = [0xFF, 0xC4];
pub const DQT: [u8; 2] = [0xFF, 0xDB];
pub const SOS: [u8; 2] = [0xFF, 0xDA];

// =============================================================================
// Stream handling
// =============================================================================

/// Whether a stream reaches its scan without defining any table.
pub fn is_abbreviated_stream(data: &[u8]) -> bool {
    if data.len() < 4 || data[0..2] != SOI {
        return false;
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = [data[pos], data[pos + 1]];
        if marker == DQT || marker == DHT {
            return false;
        }
        if marker == SOS {
            return true;
        }
        // Skip the segment body using its big-endian length.
        if pos + 3 < data.len() && marker[1] != 0x00 && marker != SOI && marker != EOI {
            let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 2 + length;
        } else {
            pos += 2;
        }
    }
    false
}

/// Number of colour components declared by the stream's frame header.
///
/// Returns `None` if no SOF segment precedes the first scan.
pub fn frame_components(data: &[u8]) -> Option<usize> {
    if data.len() < 4 || data[0..2] != SOI {
        return None;
    }

    let mut pos = 2;
    while pos + 3 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        let marker = data[pos + 1];
        match marker {
            // Fill byte before a marker.
            0xFF => {
                pos += 1;
                continue;
            }
            0xDA | 0xD9 => return None,
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            // SOF0..SOF15, except DHT, JPG and DAC.
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                return data.get(pos + 9).map(|&n| n as usize);
            }
            _ => {}
        }
        let length = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 2 + length;
    }
    None
}

/// Splice `JPEGTables` in front of an abbreviated block.
pub fn merge_jpeg_tables(tables: &[u8], block: &[u8]) -> Bytes {
    if tables.is_empty() {
        return Bytes::copy_from_slice(block);
    }
    if block.is_empty() {
        return Bytes::new();
    }

    let tables_end = if tables.ends_with(&EOI) {
        tables.len() - 2
    } else {
        tables.len()
    };
    let block_start = if block.starts_with(&SOI) { 2 } else { 0 };

    let mut merged = BytesMut::with_capacity(tables_end + block.len() - block_start);
    merged.extend_from_slice(&tables[..tables_end]);
    merged.extend_from_slice(&block[block_start..]);
    merged.freeze()
}

/// A complete stream for the block, merging tables only when it needs them.
pub fn prepare_block(tables: Option<&[u8]>, block: &[u8]) -> Bytes {
    match tables {
        Some(tables) if is_abbreviated_stream(block) => merge_jpeg_tables(tables, block),
        _ => Bytes::copy_from_slice(block),
    }
}

/// Decode a JPEG block to pixels.
pub fn decode_block(tables: Option<&[u8]>, block: &[u8]) -> Result<PixelArray, TileError> {
    let stream = prepare_block(tables, block);
    decode_image(&stream)
}
