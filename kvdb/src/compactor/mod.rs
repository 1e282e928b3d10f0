//! Online compaction of value-bearing files.
//!
//! Overwritten and erased values leave dead bytes in transaction logs and
//! pure value files. A compaction pass measures how much of each file the
//! current version still uses, copies the live values of the most wasteful
//! files into a fresh pure value file, repoints the tree at the copies and
//! retires the old files once no reader needs them.
//!
//! The pass itself lives in [`Compactor`]; the engine it runs against is
//! abstracted by [`CompactionHost`].

#[allow(clippy::module_inception)]
mod compactor;
mod file_stat;
mod host;
mod position_map;
mod task;

pub use compactor::{CompactionError, Compactor, WASTE_NOISE_FLOOR, find_most_wasteful_file};
pub use file_stat::FileStat;
pub use host::{CompactionHost, PreserveKeyIndex, select_preserved_key_index};
pub use position_map::PositionMap;
pub use task::spawn_compaction_task;
