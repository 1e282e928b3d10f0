use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::btree::TreeConfig;
use crate::config::{DbConfig, MIN_TRLOG_FILE_SIZE};
use crate::db::{DatabaseError, KeyValueDb};
use crate::files::{FileCollection, FileError, FileId, FileInfo, FileKind, MemoryFileCollection};

/// Small logs and a narrow tree, so a few hundred keys exercise rotation,
/// node splits and compaction.
pub fn test_config() -> DbConfig {
    DbConfig {
        max_trlog_file_size: MIN_TRLOG_FILE_SIZE,
        max_inline_value_size: 16,
        tree: TreeConfig::new(8, 8),
        compaction_block_size: 4096,
    }
}

/// Open a database over a fresh in-memory collection.
pub fn memory_database(
    config: DbConfig,
) -> Result<(KeyValueDb, Arc<MemoryFileCollection>), DatabaseError> {
    let files = Arc::new(MemoryFileCollection::new());
    let db = KeyValueDb::open(Arc::clone(&files) as Arc<dyn FileCollection>, config)?;
    Ok((db, files))
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key{i:05}").into_bytes()
}

/// A value of `size` bytes that encodes `i` and `round`.
pub fn value(i: usize, round: usize, size: usize) -> Vec<u8> {
    let mut value = format!("value{i}:{round}:").into_bytes();
    let fill = b'a' + u8::try_from(i % 26).unwrap_or(0);
    value.resize(size.max(value.len()), fill);
    value
}

/// Write `count` keys, then overwrite every even key. Each write is its own
/// transaction.
pub fn fill_and_overwrite(db: &KeyValueDb, count: usize, value_size: usize) -> Result<(), DatabaseError> {
    for i in 0..count {
        let mut tx = db.begin_write()?;
        tx.set(&key(i), &value(i, 0, value_size))?;
        tx.commit()?;
    }
    for i in (0..count).step_by(2) {
        let mut tx = db.begin_write()?;
        tx.set(&key(i), &value(i, 1, value_size))?;
        tx.commit()?;
    }
    Ok(())
}

/// What `fill_and_overwrite` leaves behind.
pub fn expected_after_fill(count: usize, value_size: usize) -> BTreeMap<Vec<u8>, Vec<u8>> {
    (0..count)
        .map(|i| (key(i), value(i, usize::from(i % 2 == 0), value_size)))
        .collect()
}

/// Number of files that may hold values.
pub fn value_file_count(files: &dyn FileCollection) -> usize {
    files
        .file_infos()
        .values()
        .filter(|info| info.kind != FileKind::KeyIndex)
        .count()
}

/// Every key and value of the last committed version.
pub fn read_all(db: &KeyValueDb) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, DatabaseError> {
    let tx = db.begin_read()?;
    tx.iter()
        .filter(|(_, value)| !value.is_tombstone())
        .map(|(key, value)| Ok((key.to_vec(), tx.read_value(value)?)))
        .collect()
}

/// An in-memory collection whose reads or size lookups can be switched to
/// fail with an I/O error.
#[derive(Default)]
pub struct FaultyFiles {
    inner: MemoryFileCollection,
    pub fail_reads: AtomicBool,
    pub fail_sizes: AtomicBool,
}

impl FaultyFiles {
    pub fn new() -> Self {
        Self::default()
    }
}

fn injected(flag: &AtomicBool) -> Result<(), FileError> {
    if flag.load(Ordering::SeqCst) {
        return Err(FileError::Io(std::io::Error::other("injected failure")));
    }
    Ok(())
}

impl FileCollection for FaultyFiles {
    fn file_infos(&self) -> BTreeMap<FileId, FileInfo> {
        self.inner.file_infos()
    }

    fn file_info(&self, file_id: FileId) -> Option<FileInfo> {
        self.inner.file_info(file_id)
    }

    fn create_file(&self, kind: FileKind, sub_db_id: u32) -> Result<FileId, FileError> {
        self.inner.create_file(kind, sub_db_id)
    }

    fn size(&self, file_id: FileId) -> Result<u64, FileError> {
        injected(&self.fail_sizes)?;
        self.inner.size(file_id)
    }

    fn read_at(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<(), FileError> {
        injected(&self.fail_reads)?;
        self.inner.read_at(file_id, buf, offset)
    }

    fn append(&self, file_id: FileId, data: &[u8]) -> Result<u64, FileError> {
        self.inner.append(file_id, data)
    }

    fn flush(&self, file_id: FileId) -> Result<(), FileError> {
        self.inner.flush(file_id)
    }

    fn truncate(&self, file_id: FileId) -> Result<(), FileError> {
        self.inner.truncate(file_id)
    }

    fn mark_as_unknown(&self, file_ids: &[FileId]) {
        self.inner.mark_as_unknown(file_ids);
    }

    fn delete_all_unknown_files(&self) -> Result<usize, FileError> {
        self.inner.delete_all_unknown_files()
    }
}
