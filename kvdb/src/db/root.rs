//! Committed versions of the database.

use crate::btree::PersistentTree;
use crate::files::FileId;

/// One committed version: an immutable tree plus where and when it was
/// committed.
///
/// Roots are shared as `Arc<RootNode>` between the engine and every
/// transaction reading them. A root stays alive as long as any transaction
/// holds it; its tree nodes are freed once no root reaches them.
#[derive(Debug, Clone)]
pub struct RootNode {
    pub tree: PersistentTree,
    /// Id of the transaction that produced this version.
    pub transaction_id: u64,
    /// Generation of the transaction log file holding the commit record.
    pub generation: i64,
    /// Transaction log file holding the commit record.
    pub trlog_file_id: FileId,
    /// Offset just past the commit record in that file.
    pub trlog_offset: u64,
    /// User marker attached to the commit.
    pub commit_ulong: u64,
}

impl RootNode {
    /// Ids of the files this version references, tombstones included,
    /// deduplicated and sorted.
    #[must_use]
    pub fn referenced_files(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self
            .tree
            .iter()
            .filter_map(|(_, value)| value.value_ref().map(|r| r.file_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
