//! Rebuild the last committed version from the files on open.
//!
//! # Recovery
//!
//! 1. Load the newest key index that passes its checksum. Newer key indexes
//!    that fail are marked unknown.
//! 2. Replay transaction logs created at or after the key index's log file,
//!    starting at the recorded offset, in creation order.
//! 3. Apply a transaction only when its commit record is present and its
//!    checksum matches. A torn tail is discarded.
//!
//! A transaction may start in one log file and commit in the next, so
//! pending operations carry over a clean end of file.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::{MemberValue, PersistentTree, ValueRef};
use crate::config::DbConfig;
use crate::db::error::DatabaseError;
use crate::db::key_index::{KeyIndexInfo, load_key_index, read_key_index_info};
use crate::db::trlog::{LogReader, LogRecord};
use crate::files::{FileCollection, FileId, FileKind};

/// Where the recovered version was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPosition {
    pub trlog_file_id: FileId,
    pub trlog_offset: u64,
    pub generation: i64,
}

/// The result of recovery.
#[derive(Debug)]
pub struct Recovered {
    pub tree: PersistentTree,
    pub transaction_id: u64,
    pub commit_ulong: u64,
    /// `None` if nothing was ever committed.
    pub position: Option<CommitPosition>,
    /// Every usable key index.
    pub key_indexes: BTreeMap<FileId, KeyIndexInfo>,
    pub replayed_transactions: usize,
    pub discarded_transactions: usize,
}

enum PendingOp {
    Set { key: Vec<u8>, value: MemberValue },
    Erase { key: Vec<u8> },
}

struct Replay<'a> {
    config: &'a DbConfig,
    recovered: Recovered,
    pending: Vec<PendingOp>,
    checksum: crc32fast::Hasher,
}

/// Recover the last committed version stored in `files`.
pub fn recover(files: &Arc<dyn FileCollection>, config: &DbConfig) -> Result<Recovered, DatabaseError> {
    let infos = files.file_infos();

    let mut key_index_ids: Vec<(i64, FileId)> = infos
        .iter()
        .filter(|(_, info)| info.kind == FileKind::KeyIndex)
        .map(|(id, info)| (info.generation, *id))
        .collect();
    key_index_ids.sort_unstable_by(|a, b| b.cmp(a));

    let mut recovered = Recovered {
        tree: PersistentTree::new(config.tree),
        transaction_id: 0,
        commit_ulong: 0,
        position: None,
        key_indexes: BTreeMap::new(),
        replayed_transactions: 0,
        discarded_transactions: 0,
    };
    let mut base: Option<KeyIndexInfo> = None;
    let mut invalid = Vec::new();

    for (_, file_id) in key_index_ids {
        let info = if base.is_none() {
            load_key_index(files.as_ref(), file_id, config.tree).map(|loaded| {
                recovered.tree = loaded.tree;
                base = Some(loaded.info);
                loaded.info
            })
        } else {
            read_key_index_info(files.as_ref(), file_id)
        };
        match info {
            Ok(info) => {
                recovered.key_indexes.insert(file_id, info);
            }
            Err(e) => {
                tracing::warn!("ignoring key index {file_id}: {e}");
                invalid.push(file_id);
            }
        }
    }
    files.mark_as_unknown(&invalid);

    if let Some(info) = base {
        recovered.transaction_id = info.transaction_id;
        recovered.commit_ulong = info.commit_ulong;
        recovered.position = Some(CommitPosition {
            trlog_file_id: info.trlog_file_id,
            trlog_offset: info.trlog_offset,
            generation: infos
                .get(&info.trlog_file_id)
                .map_or(-1, |file| file.generation),
        });
        tracing::info!(
            "loaded key index {} with {} keys at transaction {}",
            info.file_id,
            recovered.tree.len(),
            info.transaction_id
        );
    }

    let mut replay = Replay {
        config,
        recovered,
        pending: Vec::new(),
        checksum: crc32fast::Hasher::new(),
    };
    let first_log = base.map_or(0, |info| info.trlog_file_id);
    for (file_id, info) in infos.range(first_log..) {
        if info.kind != FileKind::TransactionLog {
            continue;
        }
        let start = match base {
            Some(base) if base.trlog_file_id == *file_id => base.trlog_offset,
            _ => 0,
        };
        let data = files.read_all(*file_id)?;
        let Some(tail) = usize::try_from(start).ok().and_then(|start| data.get(start..)) else {
            tracing::warn!("log {file_id} is shorter than its key index offset {start}");
            continue;
        };
        replay.file(*file_id, info.generation, tail, start);
    }
    replay.discard_pending("unfinished transaction at end of log");

    replay.recovered.tree.validate()?;
    Ok(replay.recovered)
}

impl Replay<'_> {
    fn file(&mut self, file_id: FileId, generation: i64, data: &[u8], start: u64) {
        let mut reader = LogReader::new(data, start);
        loop {
            let (record, raw) = match reader.next_record() {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("stopping replay of log {file_id}: {e}");
                    self.discard_pending("torn transaction");
                    return;
                }
            };
            match record {
                LogRecord::Begin => {
                    self.discard_pending("transaction without commit");
                }
                LogRecord::Set {
                    key,
                    value,
                    value_offset,
                } => {
                    self.checksum.update(raw);
                    let value = if value.len() <= self.config.max_inline_value_size {
                        MemberValue::inline(value)
                    } else {
                        // Set records are bounded by MAX_VALUE_LENGTH
                        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                        let length = value.len() as i32;
                        MemberValue::Ref(ValueRef::new(file_id, value_offset, length))
                    };
                    self.pending.push(PendingOp::Set {
                        key: key.to_vec(),
                        value,
                    });
                }
                LogRecord::Erase { key } => {
                    self.checksum.update(raw);
                    self.pending.push(PendingOp::Erase { key: key.to_vec() });
                }
                LogRecord::Commit {
                    txn_id,
                    commit_ulong,
                    checksum,
                } => {
                    let computed = std::mem::take(&mut self.checksum).finalize();
                    if computed != checksum {
                        tracing::warn!(
                            "commit of transaction {txn_id} in log {file_id} has checksum 0x{checksum:08x}, expected 0x{computed:08x}"
                        );
                        self.discard_pending("torn transaction");
                        return;
                    }
                    self.apply(txn_id, commit_ulong);
                    self.recovered.position = Some(CommitPosition {
                        trlog_file_id: file_id,
                        trlog_offset: reader.offset(),
                        generation,
                    });
                }
            }
        }
    }

    fn apply(&mut self, txn_id: u64, commit_ulong: u64) {
        let tree = &mut self.recovered.tree;
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Set { key, value } => {
                    tree.upsert(&key, value);
                }
                PendingOp::Erase { key } => {
                    tree.delete(&key);
                }
            }
        }
        self.recovered.transaction_id = txn_id;
        self.recovered.commit_ulong = commit_ulong;
        self.recovered.replayed_transactions += 1;
    }

    fn discard_pending(&mut self, reason: &str) {
        if !self.pending.is_empty() {
            tracing::warn!(
                "discarding {reason} with {} operations",
                self.pending.len()
            );
            self.recovered.discarded_transactions += 1;
            self.pending.clear();
        }
        self.checksum = crc32fast::Hasher::new();
    }
}
