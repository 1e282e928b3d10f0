//! The file collection contract.
//!
//! The engine stores everything in segment files owned by a
//! [`FileCollection`]. Each file has an id, a kind, a generation and a
//! sub-database id. Generations are assigned by the collection in creation
//! order and impose the total order used by retention decisions.
//!
//! Offsets passed to and returned from the collection address the file's
//! data region; any header an implementation keeps is invisible here.
//!
//! # Deletion
//!
//! Deletion is split in two steps:
//! - `mark_as_unknown` excludes a file from `file_infos` (soft delete)
//! - `delete_all_unknown_files` physically removes every soft-deleted file

use std::collections::BTreeMap;

/// Identifier of a segment file.
pub type FileId = u32;

/// What a segment file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileKind {
    /// Transaction log: operation records, commit markers and large values.
    TransactionLog = 1,
    /// Live value bytes relocated by compaction, nothing else.
    PureValues = 2,
    /// Key-index checkpoint: a full key to value snapshot.
    KeyIndex = 3,
}

impl TryFrom<u8> for FileKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::TransactionLog),
            2 => Ok(Self::PureValues),
            3 => Ok(Self::KeyIndex),
            _ => Err(value),
        }
    }
}

impl FileKind {
    /// File name extension used by on-disk collections.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::TransactionLog => "trl",
            Self::PureValues => "pvl",
            Self::KeyIndex => "kvi",
        }
    }

    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "trl" => Some(Self::TransactionLog),
            "pvl" => Some(Self::PureValues),
            "kvi" => Some(Self::KeyIndex),
            _ => None,
        }
    }
}

/// Metadata of a known segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    pub generation: i64,
    pub sub_db_id: u32,
}

impl FileInfo {
    /// Whether value references may point into this file.
    #[must_use]
    pub const fn contains_values(&self) -> bool {
        matches!(self.kind, FileKind::TransactionLog | FileKind::PureValues)
    }
}

/// Storage for segment files.
///
/// Implementations are shared between the writer path and the compactor and
/// must be safe to call from several threads. A given file is appended to by
/// one owner at a time.
pub trait FileCollection: Send + Sync {
    /// Snapshot of every known (not soft-deleted) file.
    fn file_infos(&self) -> BTreeMap<FileId, FileInfo>;

    /// Metadata of one known file.
    fn file_info(&self, file_id: FileId) -> Option<FileInfo>;

    /// Number of known files.
    fn count(&self) -> usize {
        self.file_infos().len()
    }

    /// Create an empty file of `kind` in sub-database `sub_db_id`.
    ///
    /// The new file gets the next id and the next generation.
    fn create_file(&self, kind: FileKind, sub_db_id: u32) -> Result<FileId, FileError>;

    /// Size of the file's data region in bytes.
    fn size(&self, file_id: FileId) -> Result<u64, FileError>;

    /// Fill `buf` from the data region starting at `offset`.
    fn read_at(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<(), FileError>;

    /// Read the whole data region.
    fn read_all(&self, file_id: FileId) -> Result<Vec<u8>, FileError> {
        let size = self.size(file_id)?;
        let len = usize::try_from(size).map_err(|_| FileError::ReadOutOfBounds {
            file_id,
            offset: 0,
            len: usize::MAX,
            size,
        })?;
        let mut buf = vec![0u8; len];
        self.read_at(file_id, &mut buf, 0)?;
        Ok(buf)
    }

    /// Append `data`, returning the offset it was written at.
    fn append(&self, file_id: FileId, data: &[u8]) -> Result<u64, FileError>;

    /// Make everything appended so far durable.
    fn flush(&self, file_id: FileId) -> Result<(), FileError>;

    /// Drop any storage past the written size.
    fn truncate(&self, file_id: FileId) -> Result<(), FileError>;

    /// Soft delete: exclude files from future use without removing them.
    fn mark_as_unknown(&self, file_ids: &[FileId]);

    /// Physically remove every soft-deleted file. Returns how many were
    /// removed.
    fn delete_all_unknown_files(&self) -> Result<usize, FileError>;
}

/// Errors that can occur in a file collection.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// The file id is not known to the collection.
    UnknownFile(FileId),
    /// A file header failed validation.
    InvalidHeader { file_id: FileId, reason: String },
    /// A read extends past the end of the data region.
    ReadOutOfBounds {
        file_id: FileId,
        offset: u64,
        len: usize,
        size: u64,
    },
    /// A lock guarding collection state was poisoned.
    LockPoisoned,
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownFile(id) => write!(f, "unknown file {id}"),
            Self::InvalidHeader { file_id, reason } => {
                write!(f, "invalid header in file {file_id}: {reason}")
            }
            Self::ReadOutOfBounds {
                file_id,
                offset,
                len,
                size,
            } => write!(
                f,
                "read of {len} bytes at {offset} out of bounds in file {file_id} (size: {size})"
            ),
            Self::LockPoisoned => write!(f, "file collection lock poisoned"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
