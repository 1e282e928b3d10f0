use crate::btree::TreeError;
use crate::cancel::Cancelled;
use crate::config::ConfigError;
use crate::files::{FileError, FileId};

/// Errors that can occur in database operations.
#[derive(Debug)]
pub enum DatabaseError {
    /// File collection error.
    File(FileError),
    /// Tree structure violated its invariants.
    Tree(TreeError),
    /// Invalid engine configuration.
    Config(ConfigError),
    /// The operation observed a cancellation request.
    Cancelled,
    /// A key index failed validation.
    CorruptKeyIndex { file_id: FileId, reason: &'static str },
    /// Key longer than [`crate::db::MAX_KEY_LENGTH`].
    KeyTooLarge { len: usize },
    /// Value longer than [`crate::db::MAX_VALUE_LENGTH`].
    ValueTooLarge { len: usize },
    /// A value reference points outside its file.
    DanglingReference { file_id: FileId, offset: u64 },
    /// A lock guarding engine state was poisoned.
    LockPoisoned,
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(e) => write!(f, "file error: {e}"),
            Self::Tree(e) => write!(f, "tree corruption: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::CorruptKeyIndex { file_id, reason } => {
                write!(f, "corrupt key index {file_id}: {reason}")
            }
            Self::KeyTooLarge { len } => write!(f, "key of {len} bytes is too large"),
            Self::ValueTooLarge { len } => write!(f, "value of {len} bytes is too large"),
            Self::DanglingReference { file_id, offset } => {
                write!(f, "value reference to file {file_id} offset {offset} is dangling")
            }
            Self::LockPoisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for DatabaseError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<TreeError> for DatabaseError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<ConfigError> for DatabaseError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<Cancelled> for DatabaseError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
