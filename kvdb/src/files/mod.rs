//! Segment file storage.
//!
//! The engine persists everything as append-only segment files held by a
//! [`FileCollection`]:
//! - transaction logs (`trl`): operations, commit markers, large values
//! - pure value files (`pvl`): live values relocated by compaction
//! - key indexes (`kvi`): full checkpoints of one committed version

mod collection;
mod directory;
pub mod header;
mod memory;
mod writer;

pub use collection::{FileCollection, FileError, FileId, FileInfo, FileKind};
pub use directory::DirectoryFileCollection;
pub use memory::MemoryFileCollection;
pub use writer::AppendWriter;
