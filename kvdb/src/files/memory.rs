//! In-memory file collection for tests.
//!
//! Behaves like [`crate::files::DirectoryFileCollection`] without touching
//! the filesystem. It also records which files were soft-deleted and
//! purged, so tests can assert on deletion order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::files::collection::{FileCollection, FileError, FileId, FileInfo, FileKind};

struct MemoryFile {
    info: FileInfo,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<FileId, MemoryFile>,
    unknown: BTreeMap<FileId, MemoryFile>,
    purged: Vec<FileId>,
    next_id: FileId,
    next_generation: i64,
}

/// A file collection held entirely in memory.
#[derive(Default)]
pub struct MemoryFileCollection {
    state: Mutex<MemoryState>,
}

impl MemoryFileCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of files that are soft-deleted but not yet purged.
    #[must_use]
    pub fn unknown_files(&self) -> Vec<FileId> {
        self.lock()
            .map(|state| state.unknown.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of every file physically removed so far, in removal order.
    #[must_use]
    pub fn purged_files(&self) -> Vec<FileId> {
        self.lock()
            .map(|state| state.purged.clone())
            .unwrap_or_default()
    }

    /// Overwrite bytes in place. Used by tests to simulate corruption.
    pub fn corrupt(&self, file_id: FileId, offset: usize, bytes: &[u8]) -> Result<(), FileError> {
        let mut state = self.lock()?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        let end = offset + bytes.len();
        if end > file.data.len() {
            file.data.resize(end, 0);
        }
        file.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Cut a file down to `len` bytes. Used by tests to simulate a torn write.
    pub fn cut(&self, file_id: FileId, len: usize) -> Result<(), FileError> {
        let mut state = self.lock()?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        file.data.truncate(len);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, FileError> {
        self.state.lock().map_err(|_| FileError::LockPoisoned)
    }
}

impl FileCollection for MemoryFileCollection {
    fn file_infos(&self) -> BTreeMap<FileId, FileInfo> {
        self.lock()
            .map(|state| state.files.iter().map(|(id, f)| (*id, f.info)).collect())
            .unwrap_or_default()
    }

    fn file_info(&self, file_id: FileId) -> Option<FileInfo> {
        self.lock()
            .ok()
            .and_then(|state| state.files.get(&file_id).map(|f| f.info))
    }

    fn create_file(&self, kind: FileKind, sub_db_id: u32) -> Result<FileId, FileError> {
        let mut state = self.lock()?;
        let file_id = state.next_id;
        state.next_id += 1;
        state.next_generation += 1;
        let info = FileInfo {
            kind,
            generation: state.next_generation,
            sub_db_id,
        };
        state.files.insert(
            file_id,
            MemoryFile {
                info,
                data: Vec::new(),
            },
        );
        Ok(file_id)
    }

    fn size(&self, file_id: FileId) -> Result<u64, FileError> {
        let state = self.lock()?;
        state
            .files
            .get(&file_id)
            .map(|f| f.data.len() as u64)
            .ok_or(FileError::UnknownFile(file_id))
    }

    fn read_at(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<(), FileError> {
        let state = self.lock()?;
        let file = state
            .files
            .get(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        let size = file.data.len() as u64;
        let len = buf.len();
        let out_of_bounds = || FileError::ReadOutOfBounds {
            file_id,
            offset,
            len,
            size,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        let src = file.data.get(start..end).ok_or_else(out_of_bounds)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn append(&self, file_id: FileId, data: &[u8]) -> Result<u64, FileError> {
        let mut state = self.lock()?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        let offset = file.data.len() as u64;
        file.data.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&self, file_id: FileId) -> Result<(), FileError> {
        self.size(file_id).map(|_| ())
    }

    fn truncate(&self, file_id: FileId) -> Result<(), FileError> {
        let mut state = self.lock()?;
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        file.data.shrink_to_fit();
        Ok(())
    }

    fn mark_as_unknown(&self, file_ids: &[FileId]) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        for file_id in file_ids {
            if let Some(file) = state.files.remove(file_id) {
                state.unknown.insert(*file_id, file);
            }
        }
    }

    fn delete_all_unknown_files(&self) -> Result<usize, FileError> {
        let mut state = self.lock()?;
        let unknown = std::mem::take(&mut state.unknown);
        let count = unknown.len();
        state.purged.extend(unknown.into_keys());
        Ok(count)
    }
}
