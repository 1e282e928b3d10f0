//! Old location to new location map built by one relocation pass.

use std::collections::HashMap;

use crate::btree::ValueRef;
use crate::files::FileId;

/// Maps `(old file, old offset)` to an offset in the pass's pure value file.
///
/// The key packs the old location as `file_id << 32 | offset`; offsets are
/// kept below 2^32 by the transaction log size limit.
#[derive(Debug, Default)]
pub struct PositionMap {
    map: HashMap<u64, u64>,
}

const fn pack(file_id: FileId, offset: u64) -> u64 {
    debug_assert!(offset <= u32::MAX as u64, "offset must fit in 32 bits");
    ((file_id as u64) << 32) | offset
}

impl PositionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the value at `(file_id, offset)` now lives at
    /// `new_offset`.
    pub fn insert(&mut self, file_id: FileId, offset: u64, new_offset: u64) {
        self.map.insert(pack(file_id, offset), new_offset);
    }

    /// New offset of the value at `(file_id, offset)`, if it moved.
    #[must_use]
    pub fn get(&self, file_id: FileId, offset: u64) -> Option<u64> {
        if offset > u64::from(u32::MAX) {
            return None;
        }
        self.map.get(&pack(file_id, offset)).copied()
    }

    /// New location of `value_ref` in `new_file_id`, sign preserved.
    #[must_use]
    pub fn remap(&self, value_ref: &ValueRef, new_file_id: FileId) -> Option<ValueRef> {
        self.get(value_ref.file_id, value_ref.offset)
            .map(|offset| value_ref.relocated(new_file_id, offset))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
