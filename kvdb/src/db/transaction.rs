//! Read and write transactions.
//!
//! A [`ReadTransaction`] pins one committed version for its lifetime; later
//! commits and compaction never change what it sees. A [`WriteTransaction`]
//! holds the engine's write lock, mutates a private copy of the last
//! committed tree, logs every operation as it goes, and publishes its copy
//! on commit. Dropping a write transaction without committing discards it.

use std::sync::{Arc, MutexGuard};

use crate::btree::{Iter, MemberValue, PersistentTree, ValueRef};
use crate::db::database::{KeyValueDb, LogState};
use crate::db::error::DatabaseError;
use crate::db::root::RootNode;
use crate::db::trlog::{LogRecordType, encode_commit, encode_erase, encode_set_prefix};
use crate::db::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH};

/// A snapshot-isolated read-only view.
pub struct ReadTransaction<'a> {
    db: &'a KeyValueDb,
    root: Arc<RootNode>,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) const fn new(db: &'a KeyValueDb, root: Arc<RootNode>) -> Self {
        Self { db, root }
    }

    /// Id of the committed transaction this view reads.
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.root.transaction_id
    }

    /// Commit marker of the version this view reads.
    #[must_use]
    pub fn commit_ulong(&self) -> u64 {
        self.root.commit_ulong
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.root.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.tree.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.root
            .tree
            .find(key)
            .map(|value| self.db.read_value(value))
            .transpose()
    }

    /// Entries in key order. Use [`ReadTransaction::read_value`] to load
    /// referenced values.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        self.root.tree.iter()
    }

    /// Entries with keys at or after `start_key`, in key order.
    #[must_use]
    pub fn iter_from(&self, start_key: &[u8]) -> Iter<'_> {
        self.root.tree.iter_from(start_key)
    }

    pub fn read_value(&self, value: &MemberValue) -> Result<Vec<u8>, DatabaseError> {
        self.db.read_value(value)
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.db.release_reader(self.root.transaction_id);
    }
}

/// The single writer.
pub struct WriteTransaction<'a> {
    db: &'a KeyValueDb,
    log: MutexGuard<'a, LogState>,
    base: Arc<RootNode>,
    tree: PersistentTree,
    commit_ulong: u64,
    checksum: crc32fast::Hasher,
    began: bool,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        db: &'a KeyValueDb,
        log: MutexGuard<'a, LogState>,
        base: Arc<RootNode>,
    ) -> Self {
        Self {
            db,
            log,
            tree: base.tree.clone(),
            commit_ulong: base.commit_ulong,
            base,
            checksum: crc32fast::Hasher::new(),
            began: false,
        }
    }

    /// Id the commit of this transaction will get.
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.base.transaction_id + 1
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Read a key, including this transaction's own changes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.tree
            .find(key)
            .map(|value| self.db.read_value(value))
            .transpose()
    }

    /// Entries in key order, including this transaction's own changes.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        self.tree.iter()
    }

    pub fn read_value(&self, value: &MemberValue) -> Result<Vec<u8>, DatabaseError> {
        self.db.read_value(value)
    }

    /// Attach a user marker to the commit.
    pub const fn set_commit_ulong(&mut self, commit_ulong: u64) {
        self.commit_ulong = commit_ulong;
    }

    /// Set `key` to `value`. Values larger than the inline limit are stored
    /// in the transaction log and referenced.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        check_key(key)?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(DatabaseError::ValueTooLarge { len: value.len() });
        }
        self.begin()?;

        // Bounded by MAX_VALUE_LENGTH
        #[allow(clippy::cast_possible_truncation)]
        let prefix = encode_set_prefix(key, value.len() as u32);
        self.db
            .reserve_log_space(&mut self.log, (prefix.len() + value.len()) as u64)?;
        self.log.writer.write(&prefix)?;
        let value_offset = self.log.writer.write(value)?;
        self.checksum.update(&prefix);
        self.checksum.update(value);

        let member = if value.len() <= self.db.config().max_inline_value_size {
            MemberValue::inline(value)
        } else {
            // Referenced bytes must be readable before commit
            self.log.writer.flush_buffer()?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let length = value.len() as i32;
            MemberValue::Ref(ValueRef::new(self.log.writer.file_id(), value_offset, length))
        };
        self.tree.upsert(key, member);
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn erase(&mut self, key: &[u8]) -> Result<bool, DatabaseError> {
        if self.tree.find_member(key).is_none() {
            return Ok(false);
        }
        self.begin()?;
        let record = encode_erase(key);
        self.db
            .reserve_log_space(&mut self.log, record.len() as u64)?;
        self.log.writer.write(&record)?;
        self.checksum.update(&record);
        self.tree.delete(key);
        Ok(true)
    }

    /// Make the changes durable and visible. Returns the id of the new
    /// version, or of the current one if nothing changed.
    pub fn commit(mut self) -> Result<u64, DatabaseError> {
        if !self.began && self.commit_ulong == self.base.commit_ulong {
            return Ok(self.base.transaction_id);
        }
        self.begin()?;

        let transaction_id = self.transaction_id();
        let checksum = std::mem::take(&mut self.checksum).finalize();
        let record = encode_commit(transaction_id, self.commit_ulong, checksum);
        self.db
            .reserve_log_space(&mut self.log, record.len() as u64)?;
        self.log.writer.write(&record)?;
        self.log.writer.hard_flush()?;

        let root = RootNode {
            tree: std::mem::take(&mut self.tree),
            transaction_id,
            generation: self.log.generation,
            trlog_file_id: self.log.writer.file_id(),
            trlog_offset: self.log.writer.position(),
            commit_ulong: self.commit_ulong,
        };
        self.db.publish(root)?;
        Ok(transaction_id)
    }

    /// Log the Begin record before the first change.
    fn begin(&mut self) -> Result<(), DatabaseError> {
        if !self.began {
            self.db.reserve_log_space(&mut self.log, 1)?;
            self.log.writer.write(&[LogRecordType::Begin as u8])?;
            self.began = true;
        }
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<(), DatabaseError> {
    if key.len() > MAX_KEY_LENGTH {
        return Err(DatabaseError::KeyTooLarge { len: key.len() });
    }
    Ok(())
}
