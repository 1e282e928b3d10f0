//! Segment file header.
//!
//! Every on-disk segment starts with a fixed 32-byte header:
//!
//! ```text
//! +--------+------------------------------------------+
//! | 0-7    | magic "KVDBSEG1"                         |
//! | 8      | file kind (1 byte)                       |
//! | 9-11   | reserved                                 |
//! | 12-15  | sub-database id (u32)                    |
//! | 16-23  | generation (i64)                         |
//! | 24-27  | reserved                                 |
//! | 28-31  | CRC32 of bytes 0-27                      |
//! +--------+------------------------------------------+
//! ```
//!
//! All integers are little-endian.

use crate::files::collection::{FileInfo, FileKind};

/// Magic number identifying a segment file.
pub const MAGIC: [u8; 8] = *b"KVDBSEG1";

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Header size as a file offset.
pub const HEADER_SIZE_U64: u64 = HEADER_SIZE as u64;

const CHECKSUM_OFFSET: usize = 28;

/// Serialize a header for `info`.
#[must_use]
pub fn encode_header(info: &FileInfo) -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..8].copy_from_slice(&MAGIC);
    bytes[8] = info.kind as u8;
    bytes[12..16].copy_from_slice(&info.sub_db_id.to_le_bytes());
    bytes[16..24].copy_from_slice(&info.generation.to_le_bytes());
    let checksum = crc32fast::hash(&bytes[..CHECKSUM_OFFSET]);
    bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
    bytes
}

/// Parse and validate a header.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> Result<FileInfo, &'static str> {
    if bytes[0..8] != MAGIC {
        return Err("bad magic");
    }
    let stored = u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
    if crc32fast::hash(&bytes[..CHECKSUM_OFFSET]) != stored {
        return Err("header checksum mismatch");
    }
    let kind = FileKind::try_from(bytes[8]).map_err(|_| "unknown file kind")?;
    let sub_db_id = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&bytes[16..24]);
    Ok(FileInfo {
        kind,
        generation: i64::from_le_bytes(generation),
        sub_db_id,
    })
}
