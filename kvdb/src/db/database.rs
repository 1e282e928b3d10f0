//! The key-value engine.
//!
//! # Locking
//!
//! Three locks, always taken in this order:
//! - `compaction`: one compaction pass or checkpoint at a time
//! - `log`: the single writer, and rewrites of the committed tree
//! - `state`: the last committed root and the registry of readers
//!
//! `state` is only held for short bookkeeping, never across I/O.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::btree::MemberValue;
use crate::cancel::CancellationToken;
use crate::compactor::{
    CompactionError, CompactionHost, Compactor, PositionMap, PreserveKeyIndex,
    select_preserved_key_index,
};
use crate::config::DbConfig;
use crate::db::error::DatabaseError;
use crate::db::key_index::{KeyIndexInfo, load_used_files, write_key_index};
use crate::db::recovery::recover;
use crate::db::root::RootNode;
use crate::db::transaction::{ReadTransaction, WriteTransaction};
use crate::files::{AppendWriter, FileCollection, FileError, FileId, FileKind};

/// The transaction log currently written to.
pub(crate) struct LogState {
    pub(crate) writer: AppendWriter,
    pub(crate) generation: i64,
}

struct DbState {
    last_committed: Arc<RootNode>,
    /// Running read transactions by the transaction id they read, with the
    /// root they pin and how many readers share it.
    readers: BTreeMap<u64, (Arc<RootNode>, usize)>,
    /// Known key indexes.
    key_indexes: BTreeMap<FileId, KeyIndexInfo>,
    preserve_history_up_to: Option<u64>,
}

/// An embedded key-value store over a [`FileCollection`].
pub struct KeyValueDb {
    files: Arc<dyn FileCollection>,
    config: DbConfig,
    log: Mutex<LogState>,
    state: Mutex<DbState>,
    compaction: Mutex<()>,
    compaction_notify: Arc<Notify>,
}

impl KeyValueDb {
    /// Open the database stored in `files`, recovering the last committed
    /// version, and start a fresh transaction log for new writes.
    pub fn open(files: Arc<dyn FileCollection>, config: DbConfig) -> Result<Self, DatabaseError> {
        config.validate()?;
        let recovered = recover(&files, &config)?;

        let removed = files.delete_all_unknown_files()?;
        if removed > 0 {
            tracing::debug!("deleted {removed} unknown files");
        }

        let trlog_file_id = files.create_file(FileKind::TransactionLog, 0)?;
        let writer = AppendWriter::new(Arc::clone(&files), trlog_file_id)?;
        let generation = generation_of(files.as_ref(), trlog_file_id);

        let root = match recovered.position {
            Some(position) => RootNode {
                tree: recovered.tree,
                transaction_id: recovered.transaction_id,
                generation: position.generation,
                trlog_file_id: position.trlog_file_id,
                trlog_offset: position.trlog_offset,
                commit_ulong: recovered.commit_ulong,
            },
            None => RootNode {
                tree: recovered.tree,
                transaction_id: recovered.transaction_id,
                generation,
                trlog_file_id,
                trlog_offset: 0,
                commit_ulong: recovered.commit_ulong,
            },
        };

        tracing::info!(
            "opened database with {} keys at transaction {} ({} transactions replayed, {} discarded)",
            root.tree.len(),
            root.transaction_id,
            recovered.replayed_transactions,
            recovered.discarded_transactions
        );

        Ok(Self {
            files,
            config,
            log: Mutex::new(LogState { writer, generation }),
            state: Mutex::new(DbState {
                last_committed: Arc::new(root),
                readers: BTreeMap::new(),
                key_indexes: recovered.key_indexes,
                preserve_history_up_to: None,
            }),
            compaction: Mutex::new(()),
            compaction_notify: Arc::new(Notify::new()),
        })
    }

    #[must_use]
    pub fn files(&self) -> &Arc<dyn FileCollection> {
        &self.files
    }

    #[must_use]
    pub const fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Signal the background compaction task listens on. Notified whenever a
    /// transaction log fills up.
    #[must_use]
    pub fn compaction_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.compaction_notify)
    }

    /// Start a read transaction on the last committed version.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_>, DatabaseError> {
        let mut state = self.lock_state()?;
        let root = Arc::clone(&state.last_committed);
        state
            .readers
            .entry(root.transaction_id)
            .or_insert_with(|| (Arc::clone(&root), 0))
            .1 += 1;
        Ok(ReadTransaction::new(self, root))
    }

    /// Start the write transaction. Blocks while another one is running.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, DatabaseError> {
        let log = self.log.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let base = self.last_committed_root()?;
        Ok(WriteTransaction::new(self, log, base))
    }

    /// Load the bytes of a stored value.
    pub fn read_value(&self, value: &MemberValue) -> Result<Vec<u8>, DatabaseError> {
        match value {
            MemberValue::Inline(bytes) => Ok(bytes.to_vec()),
            MemberValue::Ref(r) if r.is_tombstone() => Ok(Vec::new()),
            MemberValue::Ref(r) => {
                let mut buf = vec![0u8; r.stored_length() as usize];
                self.files
                    .read_at(r.file_id, &mut buf, r.offset)
                    .map_err(|e| match e {
                        FileError::UnknownFile(_) | FileError::ReadOutOfBounds { .. } => {
                            DatabaseError::DanglingReference {
                                file_id: r.file_id,
                                offset: r.offset,
                            }
                        }
                        e => DatabaseError::File(e),
                    })?;
                Ok(buf)
            }
        }
    }

    /// Run one compaction pass. Returns whether values were relocated.
    pub fn compact(&self, cancel: &CancellationToken) -> Result<bool, CompactionError> {
        let _guard = self
            .compaction
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned)?;
        Compactor::new(self, cancel).run()
    }

    /// Write a key index of the last committed version now.
    pub fn create_key_index(&self) -> Result<KeyIndexInfo, DatabaseError> {
        let _guard = self
            .compaction
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned)?;
        let infos = self.build_key_index_infos()?;
        let preserve_key = self.calculate_preserve_key_index_key(&infos)?;
        let preserve_generation = self.calculate_preserve_key_index_generation(preserve_key);
        self.write_checkpoint(&CancellationToken::new(), preserve_generation)
    }

    /// Keep the newest key index whose commit ulong is at most `up_to`, and
    /// every file it needs, alive. `None` preserves nothing.
    pub fn preserve_history_up_to_commit_ulong(&self, up_to: Option<u64>) -> Result<(), DatabaseError> {
        self.lock_state()?.preserve_history_up_to = up_to;
        Ok(())
    }

    /// Flush the log and write a final key index. Must not be called while
    /// this thread holds a transaction.
    pub fn close(&self) -> Result<(), DatabaseError> {
        self.log
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned)?
            .writer
            .hard_flush()?;
        self.create_key_index()?;
        tracing::info!("database closed");
        Ok(())
    }

    pub(crate) fn last_committed_root(&self) -> Result<Arc<RootNode>, DatabaseError> {
        Ok(Arc::clone(&self.lock_state()?.last_committed))
    }

    pub(crate) fn release_reader(&self, transaction_id: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some((_, count)) = state.readers.get_mut(&transaction_id) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&transaction_id);
            }
        }
    }

    pub(crate) fn publish(&self, root: RootNode) -> Result<(), DatabaseError> {
        self.lock_state()?.last_committed = Arc::new(root);
        Ok(())
    }

    /// Rotate to a new transaction log if `len` more bytes would not fit.
    ///
    /// A log only rotates once it holds data, so a record larger than the
    /// limit still gets written.
    pub(crate) fn reserve_log_space(&self, log: &mut LogState, len: u64) -> Result<(), DatabaseError> {
        let position = log.writer.position();
        if position == 0 || position + len <= self.config.max_trlog_file_size {
            return Ok(());
        }
        let file_id = self.files.create_file(FileKind::TransactionLog, 0)?;
        let writer = AppendWriter::new(Arc::clone(&self.files), file_id)?;
        let previous = std::mem::replace(&mut log.writer, writer);
        log.generation = generation_of(self.files.as_ref(), file_id);
        let size = previous.finish()?;
        tracing::debug!(
            "rotated transaction log {} at {size} bytes to {file_id}",
            log.writer.file_id()
        );
        self.compaction_notify.notify_one();
        Ok(())
    }

    fn write_checkpoint(
        &self,
        cancel: &CancellationToken,
        preserve_generation: i64,
    ) -> Result<KeyIndexInfo, DatabaseError> {
        let root = self.last_committed_root()?;
        let mut used_generations: Vec<i64> = root
            .referenced_files()
            .into_iter()
            .filter_map(|file_id| self.files.file_info(file_id).map(|info| info.generation))
            .collect();
        used_generations.sort_unstable();
        used_generations.dedup();

        let info = write_key_index(&self.files, &root, &used_generations, cancel)?;
        tracing::info!(
            "wrote key index {} at transaction {} with {} keys",
            info.file_id,
            info.transaction_id,
            root.tree.len()
        );

        let retired: Vec<FileId> = {
            let mut state = self.lock_state()?;
            let retired = state
                .key_indexes
                .values()
                .filter(|old| old.generation != preserve_generation)
                .map(|old| old.file_id)
                .collect::<Vec<_>>();
            for file_id in &retired {
                state.key_indexes.remove(file_id);
            }
            state.key_indexes.insert(info.file_id, info);
            retired
        };
        if !retired.is_empty() {
            tracing::debug!("retiring key indexes {retired:?}");
            self.files.mark_as_unknown(&retired);
        }
        Ok(info)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, DbState>, DatabaseError> {
        self.state.lock().map_err(|_| DatabaseError::LockPoisoned)
    }
}

fn generation_of(files: &dyn FileCollection, file_id: FileId) -> i64 {
    files.file_info(file_id).map_or(-1, |info| info.generation)
}

impl CompactionHost for KeyValueDb {
    fn file_collection(&self) -> &Arc<dyn FileCollection> {
        &self.files
    }

    fn mark_as_unknown(&self, file_ids: &[FileId]) {
        if let Ok(mut state) = self.state.lock() {
            for file_id in file_ids {
                state.key_indexes.remove(file_id);
            }
        }
        self.files.mark_as_unknown(file_ids);
    }

    fn max_trlog_file_size(&self) -> u64 {
        self.config.max_trlog_file_size
    }

    fn compaction_block_size(&self) -> usize {
        self.config.compaction_block_size
    }

    fn are_all_transactions_before_finished(&self, transaction_id: u64) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| state.readers.range(..transaction_id).next().is_none())
    }

    fn oldest_root(&self) -> Result<Arc<RootNode>, DatabaseError> {
        let state = self.lock_state()?;
        Ok(Arc::clone(
            state
                .readers
                .values()
                .next()
                .map_or(&state.last_committed, |(root, _)| root),
        ))
    }

    fn last_committed(&self) -> Result<Arc<RootNode>, DatabaseError> {
        self.last_committed_root()
    }

    fn replace_btree_values(
        &self,
        cancel: &CancellationToken,
        file_id: FileId,
        map: &PositionMap,
    ) -> Result<u64, DatabaseError> {
        let _log = self.log.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let base = self.last_committed_root()?;
        let mut tree = base.tree.clone();
        let changed = tree.replace_values(cancel, |value_ref| map.remap(value_ref, file_id))?;

        let transaction_id = base.transaction_id + 1;
        self.publish(RootNode {
            tree,
            transaction_id,
            generation: base.generation,
            trlog_file_id: base.trlog_file_id,
            trlog_offset: base.trlog_offset,
            commit_ulong: base.commit_ulong,
        })?;
        tracing::debug!("moved {changed} values into {file_id} in transaction {transaction_id}");
        Ok(transaction_id)
    }

    fn create_index_file(
        &self,
        cancel: &CancellationToken,
        preserve_generation: i64,
    ) -> Result<(), DatabaseError> {
        self.write_checkpoint(cancel, preserve_generation).map(|_| ())
    }

    fn start_pure_values_file(&self) -> Result<(AppendWriter, FileId), DatabaseError> {
        let file_id = self.files.create_file(FileKind::PureValues, 0)?;
        Ok((AppendWriter::new(Arc::clone(&self.files), file_id)?, file_id))
    }

    fn load_used_files_from_key_index(&self, file_id: FileId) -> Result<Vec<i64>, DatabaseError> {
        load_used_files(self.files.as_ref(), file_id)
    }

    fn build_key_index_infos(&self) -> Result<Vec<KeyIndexInfo>, DatabaseError> {
        let mut infos: Vec<KeyIndexInfo> = self.lock_state()?.key_indexes.values().copied().collect();
        infos.sort_unstable_by_key(|info| info.generation);
        Ok(infos)
    }

    fn calculate_preserve_key_index_key(
        &self,
        infos: &[KeyIndexInfo],
    ) -> Result<PreserveKeyIndex, DatabaseError> {
        let preserve_up_to = self.lock_state()?.preserve_history_up_to;
        Ok(select_preserved_key_index(infos, preserve_up_to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::btree::ValueRef;
    use crate::compactor::CompactionError;
    use crate::db::MAX_KEY_LENGTH;
    use crate::files::{DirectoryFileCollection, MemoryFileCollection};
    use crate::testing::{
        FaultyFiles, expected_after_fill, fill_and_overwrite, key, memory_database, read_all, test_config,
        value,
    };

    fn reopen(files: &Arc<MemoryFileCollection>) -> KeyValueDb {
        KeyValueDb::open(Arc::clone(files) as Arc<dyn FileCollection>, test_config())
            .expect("reopen")
    }

    fn kinds(files: &dyn FileCollection, kind: FileKind) -> Vec<FileId> {
        files
            .file_infos()
            .into_iter()
            .filter(|(_, info)| info.kind == kind)
            .map(|(file_id, _)| file_id)
            .collect()
    }

    fn compact_until_idle(db: &KeyValueDb) {
        for _ in 0..20 {
            if !db.compact(&CancellationToken::new()).expect("compact") {
                return;
            }
        }
        panic!("compaction never settled");
    }

    #[test]
    fn test_set_get_erase() {
        let (db, _files) = memory_database(test_config()).expect("open");

        let mut tx = db.begin_write().expect("begin");
        tx.set(b"small", b"inline").expect("set");
        tx.set(b"large", &[7u8; 100]).expect("set");
        assert_eq!(tx.get(b"small").expect("get"), Some(b"inline".to_vec()));
        assert_eq!(tx.get(b"large").expect("get"), Some(vec![7u8; 100]));
        let id = tx.commit().expect("commit");
        assert_eq!(id, 1);

        let mut tx = db.begin_write().expect("begin");
        assert!(tx.erase(b"small").expect("erase"));
        assert!(!tx.erase(b"missing").expect("erase"));
        tx.commit().expect("commit");

        let read = db.begin_read().expect("read");
        assert_eq!(read.transaction_id(), 2);
        assert_eq!(read.get(b"small").expect("get"), None);
        assert_eq!(read.get(b"large").expect("get"), Some(vec![7u8; 100]));
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn test_uncommitted_changes_are_invisible_and_dropped() {
        let (db, files) = memory_database(test_config()).expect("open");
        {
            let mut tx = db.begin_write().expect("begin");
            tx.set(b"a", b"1").expect("set");
            tx.commit().expect("commit");
        }
        {
            let mut tx = db.begin_write().expect("begin");
            tx.set(b"b", b"2").expect("set");
            let read = db.begin_read().expect("read");
            assert_eq!(read.get(b"b").expect("get"), None);
            drop(read);
            // Dropped without commit
        }

        assert_eq!(db.begin_read().expect("read").get(b"b").expect("get"), None);
        drop(db);
        let db = reopen(&files);
        let all = read_all(&db).expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(b"a".as_slice()), Some(&b"1".to_vec()));
    }

    #[test]
    fn test_empty_commit_is_a_no_op() {
        let (db, files) = memory_database(test_config()).expect("open");
        let size = files.size(0).expect("size");

        let tx = db.begin_write().expect("begin");
        assert_eq!(tx.commit().expect("commit"), 0);

        assert_eq!(files.size(0).expect("size"), size);
    }

    #[test]
    fn test_key_too_large() {
        let (db, _files) = memory_database(test_config()).expect("open");
        let mut tx = db.begin_write().expect("begin");

        let result = tx.set(&vec![0u8; MAX_KEY_LENGTH + 1], b"x");

        assert!(matches!(result, Err(DatabaseError::KeyTooLarge { .. })));
    }

    #[test]
    fn test_read_failure_is_not_a_dangling_reference() {
        let files = Arc::new(FaultyFiles::new());
        let db = KeyValueDb::open(Arc::clone(&files) as Arc<dyn FileCollection>, test_config())
            .expect("open");
        let mut tx = db.begin_write().expect("begin");
        tx.set(&key(1), &value(1, 0, 100)).expect("set");
        tx.commit().expect("commit");

        files.fail_reads.store(true, Ordering::SeqCst);
        let result = db.begin_read().expect("read").get(&key(1));

        assert!(matches!(result, Err(DatabaseError::File(FileError::Io(_)))));
    }

    #[test]
    fn test_reference_to_missing_file_is_dangling() {
        let (db, _files) = memory_database(test_config()).expect("open");

        let result = db.read_value(&MemberValue::Ref(ValueRef::new(999, 0, 100)));

        assert!(matches!(
            result,
            Err(DatabaseError::DanglingReference { file_id: 999, offset: 0 })
        ));
    }

    #[test]
    fn test_compaction_conserves_values() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        let before = read_all(&db).expect("read");
        assert_eq!(before, expected_after_fill(100, 2048));

        let performed = db.compact(&CancellationToken::new()).expect("compact");

        assert!(performed);
        assert_eq!(read_all(&db).expect("read"), before);
        assert_eq!(kinds(files.as_ref(), FileKind::PureValues).len(), 1);
        assert!(!files.purged_files().is_empty());
    }

    #[test]
    fn test_pure_value_file_respects_budget() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 200, 2048).expect("fill");

        compact_until_idle(&db);

        let budget = test_config().max_trlog_file_size;
        for file_id in kinds(files.as_ref(), FileKind::PureValues) {
            assert!(files.size(file_id).expect("size") <= budget);
        }
        assert_eq!(read_all(&db).expect("read"), expected_after_fill(200, 2048));
    }

    #[test]
    fn test_small_waste_is_not_compacted() {
        let (db, files) = memory_database(test_config()).expect("open");
        for i in 0..40 {
            let mut tx = db.begin_write().expect("begin");
            tx.set(&key(i), &value(i, 0, 2048)).expect("set");
            tx.commit().expect("commit");
        }
        for i in 0..3 {
            let mut tx = db.begin_write().expect("begin");
            tx.set(&key(i), &value(i, 1, 2048)).expect("set");
            tx.commit().expect("commit");
        }

        let performed = db.compact(&CancellationToken::new()).expect("compact");

        assert!(!performed);
        assert!(kinds(files.as_ref(), FileKind::PureValues).is_empty());
        assert!(files.purged_files().is_empty());
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        compact_until_idle(&db);
        let layout = files.file_infos();
        let contents = read_all(&db).expect("read");

        let performed = db.compact(&CancellationToken::new()).expect("compact");

        assert!(!performed);
        assert_eq!(files.file_infos(), layout);
        assert_eq!(read_all(&db).expect("read"), contents);
    }

    #[test]
    fn test_reader_keeps_its_version_through_compaction() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        let reader = db.begin_read().expect("read");
        let logs_before = kinds(files.as_ref(), FileKind::TransactionLog);

        for i in 0..100 {
            let mut tx = db.begin_write().expect("begin");
            tx.set(&key(i), &value(i, 2, 2048)).expect("set");
            tx.commit().expect("commit");
        }
        db.compact(&CancellationToken::new()).expect("compact");

        // Nothing the reader can reach was deleted
        let logs_after = kinds(files.as_ref(), FileKind::TransactionLog);
        assert!(logs_before.iter().all(|id| logs_after.contains(id)));
        let expected = expected_after_fill(100, 2048);
        for (k, v) in &expected {
            assert_eq!(reader.get(k).expect("get").as_ref(), Some(v));
        }
        drop(reader);

        compact_until_idle(&db);
        let logs_after = kinds(files.as_ref(), FileKind::TransactionLog);
        assert!(logs_before.iter().any(|id| !logs_after.contains(id)));
        let all = read_all(&db).expect("read");
        assert_eq!(all.len(), 100);
        assert_eq!(all.get(&key(7)), Some(&value(7, 2, 2048)));
    }

    #[test]
    fn test_barrier_holds_relocated_files() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        let reader = db.begin_read().expect("read");

        assert!(db.compact(&CancellationToken::new()).expect("compact"));

        assert!(files.purged_files().is_empty());
        assert!(files.unknown_files().is_empty());
        assert_eq!(kinds(files.as_ref(), FileKind::PureValues).len(), 1);
        drop(reader);
    }

    #[test]
    fn test_erased_keys_stay_erased_after_compaction() {
        let (db, files) = memory_database(test_config()).expect("open");
        let mut tx = db.begin_write().expect("begin");
        for i in 1..=100u8 {
            tx.set(format!("k{i}").as_bytes(), &[i; 500]).expect("set");
        }
        tx.commit().expect("commit");
        let mut tx = db.begin_write().expect("begin");
        for i in 1..=50u8 {
            assert!(tx.erase(format!("k{i}").as_bytes()).expect("erase"));
        }
        tx.commit().expect("commit");
        // Move the last commit into a new log so the first one can be compacted
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"filler", &[0u8; 16 * 1024]).expect("set");
        tx.commit().expect("commit");
        assert_eq!(kinds(files.as_ref(), FileKind::TransactionLog), vec![0, 1]);

        assert!(db.compact(&CancellationToken::new()).expect("compact"));

        assert_eq!(files.purged_files(), vec![0]);
        let read = db.begin_read().expect("read");
        assert_eq!(read.get(b"k1").expect("get"), None);
        for i in 51..=100u8 {
            assert_eq!(
                read.get(format!("k{i}").as_bytes()).expect("get"),
                Some(vec![i; 500])
            );
        }
        let pure = kinds(files.as_ref(), FileKind::PureValues);
        assert_eq!(pure.len(), 1);
        let value_files: Vec<FileId> = read
            .iter()
            .filter_map(|(_, value)| value.value_ref().map(|r| r.file_id))
            .filter(|file_id| *file_id != 1)
            .collect();
        assert_eq!(value_files.len(), 50);
        assert!(value_files.iter().all(|file_id| *file_id == pure[0]));
    }

    #[test]
    fn test_cancelled_compaction_changes_nothing() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        let before = read_all(&db).expect("read");
        let transaction_id = db.begin_read().expect("read").transaction_id();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = db.compact(&cancel);

        assert!(matches!(result, Err(CompactionError::Cancelled)));
        assert_eq!(read_all(&db).expect("read"), before);
        assert_eq!(
            db.begin_read().expect("read").transaction_id(),
            transaction_id
        );
        assert!(kinds(files.as_ref(), FileKind::PureValues).is_empty());
        assert!(files.purged_files().is_empty());
    }

    #[test]
    fn test_reopen_replays_log() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 50, 2048).expect("fill");
        let mut tx = db.begin_write().expect("begin");
        tx.erase(&key(3)).expect("erase");
        tx.set_commit_ulong(42);
        tx.commit().expect("commit");
        let expected = read_all(&db).expect("read");
        drop(db);

        let db = reopen(&files);

        assert_eq!(read_all(&db).expect("read"), expected);
        let read = db.begin_read().expect("read");
        assert_eq!(read.commit_ulong(), 42);
        assert_eq!(read.transaction_id(), 76);
    }

    #[test]
    fn test_transaction_spanning_log_rotation_survives_reopen() {
        let (db, files) = memory_database(test_config()).expect("open");
        let mut tx = db.begin_write().expect("begin");
        for i in 0..60 {
            tx.set(&key(i), &value(i, 0, 2048)).expect("set");
        }
        tx.commit().expect("commit");
        assert!(kinds(files.as_ref(), FileKind::TransactionLog).len() > 1);
        drop(db);

        let db = reopen(&files);

        assert_eq!(read_all(&db).expect("read").len(), 60);
        assert_eq!(
            db.begin_read().expect("read").get(&key(59)).expect("get"),
            Some(value(59, 0, 2048))
        );
    }

    #[test]
    fn test_reopen_after_compaction_uses_key_index() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 100, 2048).expect("fill");
        compact_until_idle(&db);
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"after", b"checkpoint").expect("set");
        tx.commit().expect("commit");
        let expected = read_all(&db).expect("read");
        assert!(!kinds(files.as_ref(), FileKind::KeyIndex).is_empty());
        drop(db);

        let db = reopen(&files);

        assert_eq!(read_all(&db).expect("read"), expected);
    }

    #[test]
    fn test_torn_commit_is_discarded() {
        let (db, files) = memory_database(test_config()).expect("open");
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"a", b"1").expect("set");
        tx.commit().expect("commit");
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"b", b"2").expect("set");
        tx.commit().expect("commit");
        drop(db);
        let size = usize::try_from(files.size(0).expect("size")).expect("size");
        files.cut(0, size - 3).expect("cut");

        let db = reopen(&files);

        let read = db.begin_read().expect("read");
        assert_eq!(read.get(b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(read.get(b"b").expect("get"), None);
        assert_eq!(read.transaction_id(), 1);
    }

    #[test]
    fn test_commit_with_bad_checksum_is_discarded() {
        let (db, files) = memory_database(test_config()).expect("open");
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"a", b"1").expect("set");
        tx.commit().expect("commit");
        let mut tx = db.begin_write().expect("begin");
        tx.set(b"b", b"2").expect("set");
        tx.commit().expect("commit");
        drop(db);
        let size = files.size(0).expect("size");
        let mut last = [0u8; 1];
        files.read_at(0, &mut last, size - 1).expect("read");
        let offset = usize::try_from(size - 1).expect("size");
        files.corrupt(0, offset, &[!last[0]]).expect("corrupt");

        let db = reopen(&files);

        let read = db.begin_read().expect("read");
        assert_eq!(read.get(b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(read.get(b"b").expect("get"), None);
    }

    #[test]
    fn test_preserved_history_keeps_its_files() {
        let (db, files) = memory_database(test_config()).expect("open");
        for i in 0..60 {
            let mut tx = db.begin_write().expect("begin");
            tx.set(&key(i), &value(i, 0, 2048)).expect("set");
            tx.set_commit_ulong(1);
            tx.commit().expect("commit");
        }
        let preserved = db.create_key_index().expect("key index");
        assert_eq!(preserved.commit_ulong, 1);
        db.preserve_history_up_to_commit_ulong(Some(1)).expect("preserve");
        for i in 0..60 {
            let mut tx = db.begin_write().expect("begin");
            tx.set(&key(i), &value(i, 1, 2048)).expect("set");
            tx.set_commit_ulong(2);
            tx.commit().expect("commit");
        }

        compact_until_idle(&db);

        assert!(files.file_info(preserved.file_id).is_some());
        assert!(files.file_info(0).is_some());

        db.preserve_history_up_to_commit_ulong(None).expect("preserve");
        compact_until_idle(&db);
        db.create_key_index().expect("key index");

        assert!(files.file_info(preserved.file_id).is_none());
        assert!(files.file_info(0).is_none());
        let all = read_all(&db).expect("read");
        assert_eq!(all.len(), 60);
        assert_eq!(all.get(&key(0)), Some(&value(0, 1, 2048)));
    }

    #[test]
    fn test_newer_key_index_retires_older() {
        let (db, files) = memory_database(test_config()).expect("open");
        fill_and_overwrite(&db, 10, 100).expect("fill");

        let first = db.create_key_index().expect("key index");
        let second = db.create_key_index().expect("key index");

        assert_eq!(kinds(files.as_ref(), FileKind::KeyIndex), vec![second.file_id]);
        assert!(files.purged_files().is_empty());
        assert!(files.unknown_files().contains(&first.file_id));
    }

    #[test]
    fn test_directory_database_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let expected = {
            let files: Arc<dyn FileCollection> =
                Arc::new(DirectoryFileCollection::open(dir.path()).expect("open files"));
            let db = KeyValueDb::open(files, test_config()).expect("open");
            fill_and_overwrite(&db, 100, 2048).expect("fill");
            compact_until_idle(&db);
            let mut tx = db.begin_write().expect("begin");
            tx.erase(&key(0)).expect("erase");
            tx.commit().expect("commit");
            db.close().expect("close");
            read_all(&db).expect("read")
        };

        let files: Arc<dyn FileCollection> =
            Arc::new(DirectoryFileCollection::open(dir.path()).expect("open files"));
        let db = KeyValueDb::open(files, test_config()).expect("reopen");

        assert_eq!(read_all(&db).expect("read"), expected);
        assert_eq!(expected.len(), 99);
    }
}
