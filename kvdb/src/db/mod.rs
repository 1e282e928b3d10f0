//! Key-value engine over segment files.
//!
//! # Files
//!
//! - Transaction logs (`.trl`): every write, followed by a checksummed
//!   commit record. Large values live here until compaction moves them.
//! - Pure value files (`.pvl`): values relocated by the compactor.
//! - Key indexes (`.kvi`): checkpoints of a whole committed version.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use kvdb::config::DbConfig;
//! use kvdb::db::KeyValueDb;
//! use kvdb::files::MemoryFileCollection;
//!
//! let db = KeyValueDb::open(Arc::new(MemoryFileCollection::new()), DbConfig::default())?;
//! let mut tx = db.begin_write()?;
//! tx.set(b"hello", b"world")?;
//! tx.commit()?;
//!
//! let read = db.begin_read()?;
//! assert_eq!(read.get(b"hello")?, Some(b"world".to_vec()));
//! # Ok::<(), kvdb::db::DatabaseError>(())
//! ```

mod bytes;
mod database;
mod error;
mod key_index;
mod recovery;
mod root;
mod transaction;
mod trlog;

pub use database::KeyValueDb;
pub use error::DatabaseError;
pub use key_index::KeyIndexInfo;
pub use root::RootNode;
pub use transaction::{ReadTransaction, WriteTransaction};

/// Longest accepted key.
pub const MAX_KEY_LENGTH: usize = 1024 * 1024;

/// Longest accepted value.
pub const MAX_VALUE_LENGTH: usize = 512 * 1024 * 1024;
