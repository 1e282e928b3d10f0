//! What the compactor needs from the engine it compacts.

use std::sync::Arc;

use crate::btree::ValueRef;
use crate::cancel::CancellationToken;
use crate::compactor::position_map::PositionMap;
use crate::db::{DatabaseError, KeyIndexInfo, RootNode};
use crate::files::{AppendWriter, FileCollection, FileId};

/// Which key index must survive to keep history readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreserveKeyIndex {
    /// No history is preserved.
    Unrestricted,
    /// History is preserved but no key index is old enough to anchor it, so
    /// nothing may be touched.
    BeforeAllKeyIndexes,
    /// This key index and everything it references must survive.
    KeyIndex(FileId),
}

/// The engine side of compaction.
///
/// The compactor only reads roots and file metadata through this trait;
/// every mutation of shared state (rewriting references, writing key
/// indexes, retiring files) is a host operation, so the host decides how it
/// interacts with running transactions.
pub trait CompactionHost {
    fn file_collection(&self) -> &Arc<dyn FileCollection>;

    /// Generation of a known file, or -1.
    fn generation(&self, file_id: FileId) -> i64 {
        self.file_collection()
            .file_info(file_id)
            .map_or(-1, |info| info.generation)
    }

    /// Soft-delete files.
    fn mark_as_unknown(&self, file_ids: &[FileId]);

    /// Whether `file_id` may hold values and is older than
    /// `dont_touch_generation`.
    fn contains_values_and_does_not_touch_generation(
        &self,
        file_id: FileId,
        dont_touch_generation: i64,
    ) -> bool {
        self.file_collection()
            .file_info(file_id)
            .is_some_and(|info| info.generation < dont_touch_generation && info.contains_values())
    }

    /// Transaction log rotation size; also the capacity of a pure value file.
    fn max_trlog_file_size(&self) -> u64;

    /// Read granularity for relocation.
    fn compaction_block_size(&self) -> usize;

    /// Whether every transaction that started before `transaction_id` has
    /// finished.
    fn are_all_transactions_before_finished(&self, transaction_id: u64) -> bool;

    /// The oldest version any running transaction still reads.
    fn oldest_root(&self) -> Result<Arc<RootNode>, DatabaseError>;

    /// The newest committed version.
    fn last_committed(&self) -> Result<Arc<RootNode>, DatabaseError>;

    /// Commit a version of the last committed tree in which every reference
    /// found in `map` points into `file_id`. Returns the id of that commit.
    fn replace_btree_values(
        &self,
        cancel: &CancellationToken,
        file_id: FileId,
        map: &PositionMap,
    ) -> Result<u64, DatabaseError>;

    /// Write a key index of the last committed version and retire older key
    /// indexes, except the one with `preserve_generation`.
    fn create_index_file(
        &self,
        cancel: &CancellationToken,
        preserve_generation: i64,
    ) -> Result<(), DatabaseError>;

    /// Create a pure value file and a writer positioned at its start.
    fn start_pure_values_file(&self) -> Result<(AppendWriter, FileId), DatabaseError>;

    /// Sorted generations of the files a key index references.
    fn load_used_files_from_key_index(&self, file_id: FileId) -> Result<Vec<i64>, DatabaseError>;

    /// Generation below which preserved history lives.
    fn calculate_preserve_key_index_generation(&self, key: PreserveKeyIndex) -> i64 {
        match key {
            PreserveKeyIndex::BeforeAllKeyIndexes => -1,
            PreserveKeyIndex::KeyIndex(file_id) => self.generation(file_id),
            PreserveKeyIndex::Unrestricted => i64::MAX,
        }
    }

    /// Log bytes written since the newest key index, or `u64::MAX` if that
    /// key index lives in a different log file than `root`.
    fn distance_from_last_key_index(&self, root: &RootNode) -> Result<u64, DatabaseError> {
        let infos = self.build_key_index_infos()?;
        Ok(match infos.last() {
            Some(info) if info.trlog_file_id == self.trlog_file_id(root) => {
                root.trlog_offset.saturating_sub(info.trlog_offset)
            }
            _ => u64::MAX,
        })
    }

    /// Every known key index, oldest generation first.
    fn build_key_index_infos(&self) -> Result<Vec<KeyIndexInfo>, DatabaseError>;

    /// Pick the key index that anchors preserved history.
    fn calculate_preserve_key_index_key(
        &self,
        infos: &[KeyIndexInfo],
    ) -> Result<PreserveKeyIndex, DatabaseError>;

    /// Log file holding the commit of `root`.
    fn trlog_file_id(&self, root: &RootNode) -> FileId {
        root.trlog_file_id
    }

    /// Visit every value reference of `root`, tombstones included.
    fn iterate_root<E, F>(&self, root: &RootNode, visit: F) -> Result<(), E>
    where
        F: FnMut(&ValueRef) -> Result<(), E>,
    {
        root.tree.try_for_each_value_ref(visit)
    }
}

/// Choose the preserved key index: the newest one whose commit ulong does
/// not exceed `preserve_up_to`.
#[must_use]
pub fn select_preserved_key_index(
    infos: &[KeyIndexInfo],
    preserve_up_to: Option<u64>,
) -> PreserveKeyIndex {
    let Some(limit) = preserve_up_to else {
        return PreserveKeyIndex::Unrestricted;
    };
    infos
        .iter()
        .rev()
        .find(|info| info.commit_ulong <= limit)
        .map_or(PreserveKeyIndex::BeforeAllKeyIndexes, |info| {
            PreserveKeyIndex::KeyIndex(info.file_id)
        })
}
