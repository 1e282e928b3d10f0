#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// Layers, bottom up:
//  - files: segment files with kinds and generations
//  - btree: the persistent in-memory index, one version per commit
//  - db: transactions, logging, checkpoints and recovery
//  - compactor: moves live values out of wasteful files and retires them
//
// A commit appends to the current transaction log and publishes a new root.
// Readers pin a root; compaction only retires a file once no pinned root
// can reach it.

pub mod btree;
pub mod cancel;
pub mod compactor;
pub mod config;
pub mod db;
pub mod files;

#[cfg(test)]
mod testing;
