//! Segment Files
//!
//! Immutable on-disk store of flushed partitions, one file per flushed
//! memtable. See the storage module docs for the byte layout.

mod reader;
mod writer;

pub use reader::{SegmentReader, SegmentSource};
pub use writer::SegmentWriter;

use crate::error::{AtlasError, Result};

// =============================================================================
// Shared Constants (used by writer and reader)
// =============================================================================

/// Magic bytes identifying a segment file
pub(crate) const MAGIC: &[u8; 4] = b"ATSG";

/// Current segment format version
pub(crate) const VERSION: u16 = 2;

/// Header size: Magic (4) + Version (2) + PartitionCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + DataCRC (4) + Padding (4) = 16 bytes
pub(crate) const FOOTER_SIZE: u64 = 16;

/// Offset of the partition count inside the header
pub(crate) const COUNT_OFFSET: u64 = 6;

pub(crate) fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    bytes
        .get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or_else(|| AtlasError::Corruption(format!("truncated u16 at {}", at)))
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| AtlasError::Corruption(format!("truncated u32 at {}", at)))
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| AtlasError::Corruption(format!("truncated u64 at {}", at)))
}
