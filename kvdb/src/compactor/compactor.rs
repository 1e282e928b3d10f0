//! One compaction pass.
//!
//! # Pass
//!
//! 1. Scan: size up every value-bearing file older than the oldest live
//!    version, count the bytes the last committed version still uses in
//!    each, protect files that older versions or preserved history need,
//!    and soft-delete files nothing uses.
//! 2. Decide: if the remaining waste is small, at most write a key index
//!    and stop.
//! 3. Relocate: copy the live values of the most wasteful files into one
//!    new pure value file, recording where each one went.
//! 4. Finalize: commit a version pointing at the new locations, write a key
//!    index, and retire the relocated files once no transaction that
//!    started before that commit is still running.
//!
//! Cancellation is polled at every loop step. References change only in
//! step 4, in a single commit, so a cancelled pass leaves every version
//! readable.

use std::sync::Arc;

use crate::btree::ValueRef;
use crate::cancel::{CancellationToken, Cancelled};
use crate::compactor::file_stat::FileStat;
use crate::compactor::host::{CompactionHost, PreserveKeyIndex};
use crate::compactor::position_map::PositionMap;
use crate::db::{DatabaseError, RootNode};
use crate::files::{AppendWriter, FileError, FileId};

/// Per-file waste at or below this many bytes is not worth relocating.
pub const WASTE_NOISE_FLOOR: u32 = 1024;

/// Runs compaction passes against a host.
pub struct Compactor<'a, H: CompactionHost> {
    host: &'a H,
    cancel: &'a CancellationToken,
    file_stats: Vec<FileStat>,
}

impl<'a, H: CompactionHost> Compactor<'a, H> {
    #[must_use]
    pub const fn new(host: &'a H, cancel: &'a CancellationToken) -> Self {
        Self {
            host,
            cancel,
            file_stats: Vec::new(),
        }
    }

    /// Run one pass.
    ///
    /// Returns `Ok(true)` if values were relocated, `Ok(false)` if there was
    /// nothing worth relocating.
    pub fn run(&mut self) -> Result<bool, CompactionError> {
        let files = Arc::clone(self.host.file_collection());
        if files.count() == 0 {
            return Ok(false);
        }

        let root = self.host.oldest_root()?;
        let mut dont_touch_generation = self.host.generation(self.host.trlog_file_id(&root));
        let key_indexes = self.host.build_key_index_infos()?;
        let preserve_key = self.host.calculate_preserve_key_index_key(&key_indexes)?;
        let preserve_generation = self.host.calculate_preserve_key_index_generation(preserve_key);
        self.init_file_stats(dont_touch_generation)?;

        let mut used_files_from_old_generations = None;
        if preserve_key != PreserveKeyIndex::Unrestricted {
            let mut dont_touch_due_to_preserve = -1;
            if let PreserveKeyIndex::KeyIndex(file_id) = preserve_key {
                if let Some(info) = key_indexes.iter().find(|info| info.file_id == file_id) {
                    dont_touch_due_to_preserve = info
                        .generation
                        .min(self.host.generation(info.trlog_file_id));
                    used_files_from_old_generations =
                        Some(self.host.load_used_files_from_key_index(file_id)?);
                }
            }
            dont_touch_generation = dont_touch_generation.min(dont_touch_due_to_preserve);
        }

        let last_committed = self.host.last_committed()?;
        if !Arc::ptr_eq(&root, &last_committed) {
            self.forbid_delete_of_files_used_by(&root)?;
        }
        self.forbid_delete_preserving_history(
            dont_touch_generation,
            used_files_from_old_generations.as_deref(),
        );
        self.calculate_file_usefulness(&last_committed)?;
        self.mark_totally_useless_files_as_unknown();

        let total_waste = self.calc_total_waste();
        tracing::info!("compaction started, total waste {total_waste} bytes");
        let max_size = self.host.max_trlog_file_size();
        if total_waste < max_size / 4 {
            if self.host.distance_from_last_key_index(&root)? > max_size / 4 {
                self.host.create_index_file(self.cancel, preserve_generation)?;
            }
            files.delete_all_unknown_files()?;
            return Ok(false);
        }
        self.cancel.check()?;

        let (writer, value_file_id) = self.host.start_pure_values_file()?;
        let (mut to_remove, position_map) = self
            .relocate(writer, &root)
            .inspect_err(|_| self.host.mark_as_unknown(&[value_file_id]))?;
        let correct_in_transaction_id = self
            .host
            .replace_btree_values(self.cancel, value_file_id, &position_map)
            .inspect_err(|_| self.host.mark_as_unknown(&[value_file_id]))?;
        self.host.create_index_file(self.cancel, preserve_generation)?;

        if position_map.is_empty() {
            to_remove.push(value_file_id);
        }
        if self
            .host
            .are_all_transactions_before_finished(correct_in_transaction_id)
        {
            self.host.mark_as_unknown(&to_remove);
        } else {
            tracing::debug!(
                "transactions older than {correct_in_transaction_id} still running, keeping {} files",
                to_remove.len()
            );
        }
        files.delete_all_unknown_files()?;
        Ok(true)
    }

    /// Move the most wasteful files into `writer` until it is full.
    fn relocate(
        &mut self,
        mut writer: AppendWriter,
        root: &RootNode,
    ) -> Result<(Vec<FileId>, PositionMap), CompactionError> {
        let max_size = self.host.max_trlog_file_size();
        let value_file_id = writer.file_id();
        let mut to_remove = Vec::new();
        let mut position_map = PositionMap::new();

        loop {
            self.cancel.check()?;
            let space = i64::try_from(max_size)
                .unwrap_or(i64::MAX)
                .saturating_sub(i64::try_from(writer.position()).unwrap_or(i64::MAX));
            let Some(file_id) = find_most_wasteful_file(&self.file_stats, space) else {
                break;
            };
            self.move_values_content(&mut writer, file_id, root, &mut position_map)?;
            let stat = &mut self.file_stats[file_id as usize];
            if stat.is_free_to_delete() {
                to_remove.push(file_id);
            }
            *stat = FileStat::new(0);
        }

        let size = writer.finish()?;
        tracing::info!("compaction created pure value file {value_file_id} with {size} bytes");
        Ok((to_remove, position_map))
    }

    /// Size a stat for every value-bearing main-database file older than
    /// `dont_touch_generation`. Other slots stay empty.
    fn init_file_stats(&mut self, dont_touch_generation: i64) -> Result<(), CompactionError> {
        let infos = self.host.file_collection().file_infos();
        let len = infos.keys().next_back().map_or(0, |max| *max as usize + 1);
        self.file_stats = vec![FileStat::default(); len];
        for (file_id, info) in infos {
            if info.sub_db_id != 0
                || !self
                    .host
                    .contains_values_and_does_not_touch_generation(file_id, dont_touch_generation)
            {
                continue;
            }
            let size = self.host.file_collection().size(file_id)?;
            self.file_stats[file_id as usize] =
                FileStat::new(u32::try_from(size).unwrap_or(u32::MAX));
        }
        Ok(())
    }

    fn forbid_delete_of_files_used_by(&mut self, root: &RootNode) -> Result<(), CompactionError> {
        let cancel = self.cancel;
        let file_stats = &mut self.file_stats;
        self.host.iterate_root(root, |value_ref| -> Result<(), CompactionError> {
            cancel.check()?;
            if let Some(stat) = file_stats.get_mut(value_ref.file_id as usize) {
                stat.mark_forbid_to_delete();
            }
            Ok(())
        })
    }

    fn forbid_delete_preserving_history(
        &mut self,
        dont_touch_generation: i64,
        used_files_from_old_generations: Option<&[i64]>,
    ) {
        for (file_id, stat) in (0..).zip(self.file_stats.iter_mut()) {
            let untouchable = !self
                .host
                .contains_values_and_does_not_touch_generation(file_id, dont_touch_generation);
            let preserved = used_files_from_old_generations.is_some_and(|used| {
                used.binary_search(&self.host.generation(file_id)).is_ok()
            });
            if untouchable || preserved {
                stat.mark_forbid_to_delete();
            }
        }
    }

    fn calculate_file_usefulness(&mut self, root: &RootNode) -> Result<(), CompactionError> {
        let cancel = self.cancel;
        let file_stats = &mut self.file_stats;
        self.host.iterate_root(root, |value_ref| -> Result<(), CompactionError> {
            cancel.check()?;
            if let Some(stat) = file_stats.get_mut(value_ref.file_id as usize) {
                stat.add_length(value_ref.stored_length());
            }
            Ok(())
        })
    }

    fn mark_totally_useless_files_as_unknown(&self) {
        let useless: Vec<FileId> = (0..)
            .zip(&self.file_stats)
            .filter(|(_, stat)| stat.is_useless())
            .map(|(file_id, _)| file_id)
            .collect();
        if !useless.is_empty() {
            tracing::debug!("retiring unused files {useless:?}");
            self.host.mark_as_unknown(&useless);
        }
    }

    fn calc_total_waste(&self) -> u64 {
        self.file_stats
            .iter()
            .map(FileStat::waste)
            .filter(|waste| *waste > WASTE_NOISE_FLOOR)
            .map(u64::from)
            .sum()
    }

    /// Copy every value of `file_id` that `root` references into `writer`.
    ///
    /// The source is loaded in blocks up front; values spanning a block
    /// boundary are copied piecewise.
    fn move_values_content(
        &self,
        writer: &mut AppendWriter,
        file_id: FileId,
        root: &RootNode,
        position_map: &mut PositionMap,
    ) -> Result<(), CompactionError> {
        let files = self.host.file_collection();
        let block_size = self.host.compaction_block_size();
        let block_size_u64 = block_size as u64;
        let total_size = files.size(file_id)?;

        let mut blocks = Vec::new();
        let mut pos = 0;
        while pos < total_size {
            self.cancel.check()?;
            let read_size = (total_size - pos).min(block_size_u64);
            let mut block = vec![0u8; usize::try_from(read_size).unwrap_or(block_size)];
            files.read_at(file_id, &mut block, pos)?;
            blocks.push(block);
            pos += read_size;
        }

        let cancel = self.cancel;
        self.host.iterate_root(root, |value_ref: &ValueRef| -> Result<(), CompactionError> {
            if value_ref.file_id != file_id {
                return Ok(());
            }
            position_map.insert(file_id, value_ref.offset, writer.position());
            let mut pos = value_ref.offset;
            let mut remaining = u64::from(value_ref.stored_length());
            while remaining > 0 {
                cancel.check()?;
                let block_start = pos % block_size_u64;
                let write_size = (block_size_u64 - block_start).min(remaining);
                let chunk = usize::try_from(pos / block_size_u64)
                    .ok()
                    .and_then(|block_id| blocks.get(block_id))
                    .and_then(|block| {
                        let start = usize::try_from(block_start).ok()?;
                        let end = start.checked_add(usize::try_from(write_size).ok()?)?;
                        block.get(start..end)
                    })
                    .ok_or(DatabaseError::DanglingReference {
                        file_id,
                        offset: value_ref.offset,
                    })?;
                writer.write(chunk)?;
                remaining -= write_size;
                pos += write_size;
            }
            Ok(())
        })
    }
}

/// The file with the highest waste whose live bytes fit in `space`.
///
/// The lowest file id wins ties. Returns `None` if `space <= 0` or no file
/// has any waste.
#[must_use]
pub fn find_most_wasteful_file(file_stats: &[FileStat], space: i64) -> Option<FileId> {
    if space <= 0 {
        return None;
    }
    let mut best_waste = 0;
    let mut best_file = None;
    for (file_id, stat) in (0..).zip(file_stats) {
        let waste = stat.waste();
        if waste <= best_waste || space < i64::from(stat.used()) {
            continue;
        }
        best_waste = waste;
        best_file = Some(file_id);
    }
    best_file
}

/// Errors that can stop a compaction pass.
#[derive(Debug)]
pub enum CompactionError {
    /// The pass observed a cancellation request. Nothing was rewritten.
    Cancelled,
    /// The host failed.
    Database(DatabaseError),
    /// The file collection failed.
    File(FileError),
}

impl std::fmt::Display for CompactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "compaction cancelled"),
            Self::Database(e) => write!(f, "compaction database error: {e}"),
            Self::File(e) => write!(f, "compaction file error: {e}"),
        }
    }
}

impl std::error::Error for CompactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Database(e) => Some(e),
            Self::File(e) => Some(e),
        }
    }
}

impl From<Cancelled> for CompactionError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<FileError> for CompactionError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl From<DatabaseError> for CompactionError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Cancelled => Self::Cancelled,
            DatabaseError::File(e) => Self::File(e),
            e => Self::Database(e),
        }
    }
}
