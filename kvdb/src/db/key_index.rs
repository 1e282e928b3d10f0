//! Key index files: full checkpoints of one committed version.
//!
//! A key index lets recovery skip every transaction log record written
//! before it. It also pins history: while a key index is preserved, the
//! files it references must not be deleted.
//!
//! # File Format
//!
//! ```text
//! +-------------------+------------------------------------------+
//! | trlog_file_id     | u32, log file holding the last commit    |
//! | trlog_offset      | u64, offset just past that commit        |
//! | txn_id            | u64                                      |
//! | commit_ulong      | u64                                      |
//! | used_count        | u32                                      |
//! | used generations  | i64 * used_count, sorted                 |
//! | entry_count       | u64                                      |
//! | entries           | see below                                |
//! | crc32             | u32 over everything before it            |
//! +-------------------+------------------------------------------+
//!
//! entry: key_len (u32) | key | tag (u8)
//!        tag 0: len (u32) | inline bytes
//!        tag 1: file_id (u32) | offset (u64) | length (i32)
//! ```

use std::sync::Arc;

use crate::btree::{Key, MemberValue, PersistentTree, TreeConfig, ValueRef};
use crate::cancel::CancellationToken;
use crate::db::bytes::ByteReader;
use crate::db::error::DatabaseError;
use crate::db::root::RootNode;
use crate::files::{AppendWriter, FileCollection, FileId, FileKind};

/// Bytes before the used-generation list.
const FIXED_PREFIX_SIZE: usize = 4 + 8 + 8 + 8 + 4;

const TAG_INLINE: u8 = 0;
const TAG_REF: u8 = 1;

/// Entries written between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// What a key index records about the version it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndexInfo {
    pub file_id: FileId,
    pub generation: i64,
    pub trlog_file_id: FileId,
    pub trlog_offset: u64,
    pub transaction_id: u64,
    pub commit_ulong: u64,
}

struct ChecksummedWriter {
    writer: AppendWriter,
    hasher: crc32fast::Hasher,
}

impl ChecksummedWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), DatabaseError> {
        self.hasher.update(data);
        self.writer.write(data)?;
        Ok(())
    }

    fn finish(mut self) -> Result<(), DatabaseError> {
        let checksum = self.hasher.finalize();
        self.writer.write(&checksum.to_le_bytes())?;
        self.writer.finish()?;
        Ok(())
    }
}

/// Write a key index holding `root`.
///
/// `used_generations` lists the generations of the files `root` needs; it
/// must be sorted. A cancelled or failed write leaves no key index behind:
/// the partial file is marked unknown.
pub fn write_key_index(
    files: &Arc<dyn FileCollection>,
    root: &RootNode,
    used_generations: &[i64],
    cancel: &CancellationToken,
) -> Result<KeyIndexInfo, DatabaseError> {
    let file_id = files.create_file(FileKind::KeyIndex, 0)?;
    let result = AppendWriter::new(Arc::clone(files), file_id)
        .map_err(DatabaseError::from)
        .and_then(|writer| {
            write_body(
                ChecksummedWriter {
                    writer,
                    hasher: crc32fast::Hasher::new(),
                },
                root,
                used_generations,
                cancel,
            )
        });
    if let Err(e) = result {
        files.mark_as_unknown(&[file_id]);
        return Err(e);
    }

    let generation = files
        .file_info(file_id)
        .map_or(-1, |info| info.generation);
    Ok(KeyIndexInfo {
        file_id,
        generation,
        trlog_file_id: root.trlog_file_id,
        trlog_offset: root.trlog_offset,
        transaction_id: root.transaction_id,
        commit_ulong: root.commit_ulong,
    })
}

// Lengths are bounded by MAX_KEY_LENGTH and MAX_VALUE_LENGTH
#[allow(clippy::cast_possible_truncation)]
fn write_body(
    mut out: ChecksummedWriter,
    root: &RootNode,
    used_generations: &[i64],
    cancel: &CancellationToken,
) -> Result<(), DatabaseError> {
    out.write(&root.trlog_file_id.to_le_bytes())?;
    out.write(&root.trlog_offset.to_le_bytes())?;
    out.write(&root.transaction_id.to_le_bytes())?;
    out.write(&root.commit_ulong.to_le_bytes())?;
    out.write(&(used_generations.len() as u32).to_le_bytes())?;
    for generation in used_generations {
        out.write(&generation.to_le_bytes())?;
    }

    out.write(&(root.tree.len() as u64).to_le_bytes())?;
    for (i, (key, value)) in root.tree.iter().enumerate() {
        if i % CANCEL_CHECK_INTERVAL == 0 {
            cancel.check()?;
        }
        out.write(&(key.len() as u32).to_le_bytes())?;
        out.write(key)?;
        match value {
            MemberValue::Inline(bytes) => {
                out.write(&[TAG_INLINE])?;
                out.write(&(bytes.len() as u32).to_le_bytes())?;
                out.write(bytes)?;
            }
            MemberValue::Ref(r) => {
                out.write(&[TAG_REF])?;
                out.write(&r.file_id.to_le_bytes())?;
                out.write(&r.offset.to_le_bytes())?;
                out.write(&r.length.to_le_bytes())?;
            }
        }
    }
    out.finish()
}

/// Read the fixed part of a key index without verifying the whole file.
pub fn read_key_index_info(
    files: &dyn FileCollection,
    file_id: FileId,
) -> Result<KeyIndexInfo, DatabaseError> {
    let corrupt = |reason| DatabaseError::CorruptKeyIndex { file_id, reason };
    let generation = files
        .file_info(file_id)
        .ok_or_else(|| corrupt("not a known file"))?
        .generation;
    let mut prefix = [0u8; FIXED_PREFIX_SIZE];
    files
        .read_at(file_id, &mut prefix, 0)
        .map_err(|_| corrupt("truncated header"))?;
    let mut reader = ByteReader::new(&prefix);
    parse_info(&mut reader, file_id, generation).ok_or_else(|| corrupt("truncated header"))
}

fn parse_info(reader: &mut ByteReader<'_>, file_id: FileId, generation: i64) -> Option<KeyIndexInfo> {
    Some(KeyIndexInfo {
        file_id,
        generation,
        trlog_file_id: reader.u32()?,
        trlog_offset: reader.u64()?,
        transaction_id: reader.u64()?,
        commit_ulong: reader.u64()?,
    })
}

fn parse_used_generations(reader: &mut ByteReader<'_>) -> Option<Vec<i64>> {
    let count = reader.u32()?;
    (0..count).map(|_| reader.i64()).collect()
}

/// Load the sorted generations of the files a key index needs.
pub fn load_used_files(
    files: &dyn FileCollection,
    file_id: FileId,
) -> Result<Vec<i64>, DatabaseError> {
    let corrupt = |reason| DatabaseError::CorruptKeyIndex { file_id, reason };
    let mut count = [0u8; 4];
    files
        .read_at(file_id, &mut count, (FIXED_PREFIX_SIZE - 4) as u64)
        .map_err(|_| corrupt("truncated header"))?;
    let list_len = 4 + u64::from(u32::from_le_bytes(count)) * 8;
    if (FIXED_PREFIX_SIZE as u64) + list_len > files.size(file_id)? {
        return Err(corrupt("truncated used file list"));
    }
    let list_len = usize::try_from(list_len).map_err(|_| corrupt("used file list too long"))?;
    let mut list = vec![0u8; list_len];
    files
        .read_at(file_id, &mut list, (FIXED_PREFIX_SIZE - 4) as u64)
        .map_err(|_| corrupt("truncated used file list"))?;
    parse_used_generations(&mut ByteReader::new(&list))
        .ok_or_else(|| corrupt("truncated used file list"))
}

/// A fully loaded and verified key index.
#[derive(Debug)]
pub struct LoadedKeyIndex {
    pub info: KeyIndexInfo,
    pub used_generations: Vec<i64>,
    pub tree: PersistentTree,
}

/// Load and verify a whole key index.
pub fn load_key_index(
    files: &dyn FileCollection,
    file_id: FileId,
    config: TreeConfig,
) -> Result<LoadedKeyIndex, DatabaseError> {
    let corrupt = |reason| DatabaseError::CorruptKeyIndex { file_id, reason };
    let generation = files
        .file_info(file_id)
        .ok_or_else(|| corrupt("not a known file"))?
        .generation;
    let data = files.read_all(file_id)?;
    let body_len = data
        .len()
        .checked_sub(4)
        .ok_or_else(|| corrupt("file too short"))?;
    let (body, stored) = data.split_at(body_len);
    let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    if crc32fast::hash(body) != stored {
        return Err(corrupt("checksum mismatch"));
    }

    let mut reader = ByteReader::new(body);
    let info =
        parse_info(&mut reader, file_id, generation).ok_or_else(|| corrupt("truncated header"))?;
    let used_generations =
        parse_used_generations(&mut reader).ok_or_else(|| corrupt("truncated used file list"))?;
    let count = reader.u64().ok_or_else(|| corrupt("truncated entry count"))?;

    let mut entries = Vec::new();
    for _ in 0..count {
        let entry = parse_entry(&mut reader).ok_or_else(|| corrupt("truncated entry"))?;
        entries.push(entry);
    }
    if !reader.is_at_end() {
        return Err(corrupt("trailing bytes after entries"));
    }

    let tree = PersistentTree::from_sorted(config, entries)?;
    Ok(LoadedKeyIndex {
        info,
        used_generations,
        tree,
    })
}

fn parse_entry(reader: &mut ByteReader<'_>) -> Option<(Key, MemberValue)> {
    let key = Key::from(reader.prefixed()?);
    let value = match reader.u8()? {
        TAG_INLINE => MemberValue::inline(reader.prefixed()?),
        TAG_REF => MemberValue::Ref(ValueRef::new(reader.u32()?, reader.u64()?, reader.i32()?)),
        _ => return None,
    };
    Some((key, value))
}
