//! Transaction log records.
//!
//! # Record Format
//!
//! Every record starts with a one-byte type. All integers are little-endian.
//! ```text
//! Begin:  0x01
//! Set:    0x02 | key_len (u32) | key | value_len (u32) | value
//! Erase:  0x03 | key_len (u32) | key
//! Commit: 0x04 | txn_id (u64) | commit_ulong (u64) | crc32 (u32)
//! ```
//!
//! The commit checksum covers the bytes of every Set and Erase record since
//! the preceding Begin. A transaction is applied on replay only when its
//! commit record is present and the checksum matches; anything else at the
//! tail of a file is a torn write and is discarded.
//!
//! Values stored by reference point straight at the value bytes of their Set
//! record, so the log doubles as the first home of large values.

use crate::db::bytes::ByteReader;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Transaction begin marker.
    Begin = 0x01,
    /// Key set to a value.
    Set = 0x02,
    /// Key removed.
    Erase = 0x03,
    /// Transaction commit marker.
    Commit = 0x04,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Begin),
            0x02 => Ok(Self::Set),
            0x03 => Ok(Self::Erase),
            0x04 => Ok(Self::Commit),
            _ => Err(value),
        }
    }
}

/// Size of an encoded commit record.
pub const COMMIT_RECORD_SIZE: usize = 1 + 8 + 8 + 4;

/// Encode the part of a Set record that precedes the value bytes.
#[must_use]
pub fn encode_set_prefix(key: &[u8], value_len: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + 4 + key.len() + 4);
    bytes.push(LogRecordType::Set as u8);
    push_prefixed_len(&mut bytes, key);
    bytes.extend_from_slice(key);
    bytes.extend_from_slice(&value_len.to_le_bytes());
    bytes
}

#[must_use]
pub fn encode_erase(key: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(1 + 4 + key.len());
    bytes.push(LogRecordType::Erase as u8);
    push_prefixed_len(&mut bytes, key);
    bytes.extend_from_slice(key);
    bytes
}

#[must_use]
pub fn encode_commit(txn_id: u64, commit_ulong: u64, checksum: u32) -> [u8; COMMIT_RECORD_SIZE] {
    let mut bytes = [0u8; COMMIT_RECORD_SIZE];
    bytes[0] = LogRecordType::Commit as u8;
    bytes[1..9].copy_from_slice(&txn_id.to_le_bytes());
    bytes[9..17].copy_from_slice(&commit_ulong.to_le_bytes());
    bytes[17..21].copy_from_slice(&checksum.to_le_bytes());
    bytes
}

// Key length is bounded by MAX_KEY_LENGTH before encoding
#[allow(clippy::cast_possible_truncation)]
fn push_prefixed_len(bytes: &mut Vec<u8>, key: &[u8]) {
    bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
}

/// A decoded record borrowing from the file image.
#[derive(Debug, PartialEq, Eq)]
pub enum LogRecord<'a> {
    Begin,
    Set {
        key: &'a [u8],
        value: &'a [u8],
        /// Offset of the value bytes within the file.
        value_offset: u64,
    },
    Erase {
        key: &'a [u8],
    },
    Commit {
        txn_id: u64,
        commit_ulong: u64,
        checksum: u32,
    },
}

/// Why decoding stopped before the end of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// The file ends in the middle of a record.
    Truncated { offset: u64 },
    /// Unknown record type byte.
    InvalidRecordType { offset: u64, record_type: u8 },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "log truncated at offset {offset}"),
            Self::InvalidRecordType {
                offset,
                record_type,
            } => write!(
                f,
                "invalid log record type 0x{record_type:02x} at offset {offset}"
            ),
        }
    }
}

impl std::error::Error for LogError {}

/// Sequential decoder over a transaction log image.
pub struct LogReader<'a> {
    reader: ByteReader<'a>,
    data: &'a [u8],
    start: u64,
}

impl<'a> LogReader<'a> {
    /// Decode `data`, the contents of a log file starting at offset `start`.
    #[must_use]
    pub const fn new(data: &'a [u8], start: u64) -> Self {
        Self {
            reader: ByteReader::new(data),
            data,
            start,
        }
    }

    /// File offset of the next record.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.start + self.reader.position() as u64
    }

    /// Decode the next record together with its raw bytes.
    ///
    /// Returns `Ok(None)` at a clean end of the file.
    pub fn next_record(&mut self) -> Result<Option<(LogRecord<'a>, &'a [u8])>, LogError> {
        if self.reader.is_at_end() {
            return Ok(None);
        }
        let offset = self.offset();
        let begin = self.reader.position();
        let truncated = LogError::Truncated { offset };

        let raw_type = self.reader.u8().ok_or(truncated)?;
        let record_type =
            LogRecordType::try_from(raw_type).map_err(|record_type| LogError::InvalidRecordType {
                offset,
                record_type,
            })?;

        let record = match record_type {
            LogRecordType::Begin => LogRecord::Begin,
            LogRecordType::Set => {
                let key = self.reader.prefixed().ok_or(truncated)?;
                let value_len = self.reader.u32().ok_or(truncated)?;
                let value_offset = self.offset();
                let value = usize::try_from(value_len)
                    .ok()
                    .and_then(|len| self.reader.bytes(len))
                    .ok_or(truncated)?;
                LogRecord::Set {
                    key,
                    value,
                    value_offset,
                }
            }
            LogRecordType::Erase => LogRecord::Erase {
                key: self.reader.prefixed().ok_or(truncated)?,
            },
            LogRecordType::Commit => LogRecord::Commit {
                txn_id: self.reader.u64().ok_or(truncated)?,
                commit_ulong: self.reader.u64().ok_or(truncated)?,
                checksum: self.reader.u32().ok_or(truncated)?,
            },
        };

        let raw = &self.data[begin..self.reader.position()];
        Ok(Some((record, raw)))
    }
}
