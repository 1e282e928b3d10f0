//! On-disk file collection: one file per segment in a directory.
//!
//! Files are named `{id:08}.{ext}` where the extension follows the file
//! kind (`trl`, `pvl`, `kvi`). Each starts with the header from
//! [`crate::files::header`]. Files with our naming scheme but an unreadable
//! header are treated as unknown and removed by
//! [`FileCollection::delete_all_unknown_files`]. Other files in the
//! directory are left alone.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::files::collection::{FileCollection, FileError, FileId, FileInfo, FileKind};
use crate::files::header::{HEADER_SIZE, HEADER_SIZE_U64, decode_header, encode_header};

struct OpenSegment {
    file: File,
    path: PathBuf,
    info: FileInfo,
    /// Size of the data region (excluding the header).
    size: u64,
}

struct DirectoryState {
    files: BTreeMap<FileId, OpenSegment>,
    /// Soft-deleted files awaiting physical removal.
    unknown: BTreeMap<FileId, PathBuf>,
    next_id: FileId,
    next_generation: i64,
}

/// A file collection stored in a directory.
pub struct DirectoryFileCollection {
    directory: PathBuf,
    state: Mutex<DirectoryState>,
}

impl DirectoryFileCollection {
    /// Open the collection in `directory`, creating the directory if needed.
    pub fn open(directory: &Path) -> Result<Self, FileError> {
        std::fs::create_dir_all(directory)?;

        let mut state = DirectoryState {
            files: BTreeMap::new(),
            unknown: BTreeMap::new(),
            next_id: 0,
            next_generation: 1,
        };

        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            let Some((file_id, kind)) = parse_file_name(&path) else {
                continue;
            };
            state.next_id = state.next_id.max(file_id + 1);

            match open_segment(&path, file_id, kind) {
                Ok(segment) => {
                    state.next_generation =
                        state.next_generation.max(segment.info.generation + 1);
                    state.files.insert(file_id, segment);
                }
                Err(e) => {
                    tracing::warn!("treating {} as unknown: {e}", path.display());
                    state.unknown.insert(file_id, path);
                }
            }
        }

        Ok(Self {
            directory: directory.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// The directory holding the segment files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock(&self) -> Result<MutexGuard<'_, DirectoryState>, FileError> {
        self.state.lock().map_err(|_| FileError::LockPoisoned)
    }
}

fn parse_file_name(path: &Path) -> Option<(FileId, FileKind)> {
    let kind = FileKind::from_extension(path.extension()?.to_str()?)?;
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 8 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((stem.parse().ok()?, kind))
}

fn open_segment(path: &Path, file_id: FileId, kind: FileKind) -> Result<OpenSegment, FileError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    let info = decode_header(&header).map_err(|reason| FileError::InvalidHeader {
        file_id,
        reason: reason.to_string(),
    })?;
    if info.kind != kind {
        return Err(FileError::InvalidHeader {
            file_id,
            reason: "file kind does not match extension".to_string(),
        });
    }
    let size = file.metadata()?.len().saturating_sub(HEADER_SIZE_U64);
    Ok(OpenSegment {
        file,
        path: path.to_path_buf(),
        info,
        size,
    })
}

impl FileCollection for DirectoryFileCollection {
    fn file_infos(&self) -> BTreeMap<FileId, FileInfo> {
        self.lock()
            .map(|state| state.files.iter().map(|(id, s)| (*id, s.info)).collect())
            .unwrap_or_default()
    }

    fn file_info(&self, file_id: FileId) -> Option<FileInfo> {
        self.lock()
            .ok()
            .and_then(|state| state.files.get(&file_id).map(|s| s.info))
    }

    fn create_file(&self, kind: FileKind, sub_db_id: u32) -> Result<FileId, FileError> {
        let mut state = self.lock()?;
        let file_id = state.next_id;
        let info = FileInfo {
            kind,
            generation: state.next_generation,
            sub_db_id,
        };
        let path = self
            .directory
            .join(format!("{file_id:08}.{}", kind.extension()));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&encode_header(&info))?;
        file.sync_all()?;

        state.next_id += 1;
        state.next_generation += 1;
        state.files.insert(
            file_id,
            OpenSegment {
                file,
                path,
                info,
                size: 0,
            },
        );
        Ok(file_id)
    }

    fn size(&self, file_id: FileId) -> Result<u64, FileError> {
        let state = self.lock()?;
        state
            .files
            .get(&file_id)
            .map(|s| s.size)
            .ok_or(FileError::UnknownFile(file_id))
    }

    fn read_at(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<(), FileError> {
        let state = self.lock()?;
        let segment = state
            .files
            .get(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        if offset.saturating_add(buf.len() as u64) > segment.size {
            return Err(FileError::ReadOutOfBounds {
                file_id,
                offset,
                len: buf.len(),
                size: segment.size,
            });
        }
        read_segment_at(&segment.file, buf, HEADER_SIZE_U64 + offset)?;
        Ok(())
    }

    fn append(&self, file_id: FileId, data: &[u8]) -> Result<u64, FileError> {
        let mut state = self.lock()?;
        let segment = state
            .files
            .get_mut(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        let offset = segment.size;
        segment
            .file
            .seek(SeekFrom::Start(HEADER_SIZE_U64 + offset))?;
        segment.file.write_all(data)?;
        segment.size += data.len() as u64;
        Ok(offset)
    }

    fn flush(&self, file_id: FileId) -> Result<(), FileError> {
        let state = self.lock()?;
        let segment = state
            .files
            .get(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        segment.file.sync_all()?;
        Ok(())
    }

    fn truncate(&self, file_id: FileId) -> Result<(), FileError> {
        let state = self.lock()?;
        let segment = state
            .files
            .get(&file_id)
            .ok_or(FileError::UnknownFile(file_id))?;
        segment.file.set_len(HEADER_SIZE_U64 + segment.size)?;
        Ok(())
    }

    fn mark_as_unknown(&self, file_ids: &[FileId]) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        for file_id in file_ids {
            if let Some(segment) = state.files.remove(file_id) {
                tracing::debug!("file {file_id} marked as unknown");
                state.unknown.insert(*file_id, segment.path);
            }
        }
    }

    fn delete_all_unknown_files(&self) -> Result<usize, FileError> {
        let mut state = self.lock()?;
        let unknown = std::mem::take(&mut state.unknown);
        let count = unknown.len();
        for (file_id, path) in unknown {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("deleted file {file_id}"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FileError::Io(e)),
            }
        }
        Ok(count)
    }
}

/// Read at an absolute position without moving the shared cursor.
#[cfg(unix)]
fn read_segment_at(file: &File, buf: &mut [u8], position: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, position)
}

#[cfg(not(unix))]
fn read_segment_at(mut file: &File, buf: &mut [u8], position: u64) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(position))?;
    file.read_exact(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_append_read() {
        let dir = tempdir().expect("create temp dir");
        let files = DirectoryFileCollection::open(dir.path()).expect("open");

        let id = files
            .create_file(FileKind::TransactionLog, 0)
            .expect("create");
        assert_eq!(files.append(id, b"hello").expect("append"), 0);
        assert_eq!(files.append(id, b" world").expect("append"), 5);

        let mut buf = [0u8; 5];
        files.read_at(id, &mut buf, 6).expect("read");
        assert_eq!(&buf, b"world");
        assert_eq!(files.size(id).expect("size"), 11);
    }

    #[test]
    fn test_reads_between_appends_keep_append_position() {
        let dir = tempdir().expect("create temp dir");
        let files = DirectoryFileCollection::open(dir.path()).expect("open");
        let id = files.create_file(FileKind::PureValues, 0).expect("create");

        files.append(id, b"first").expect("append");
        let mut buf = [0u8; 3];
        files.read_at(id, &mut buf, 1).expect("read");
        assert_eq!(&buf, b"irs");
        assert_eq!(files.append(id, b"second").expect("append"), 5);

        let mut all = [0u8; 11];
        files.read_at(id, &mut all, 0).expect("read");
        assert_eq!(&all, b"firstsecond");
    }

    #[test]
    fn test_generations_survive_reopen() {
        let dir = tempdir().expect("create temp dir");
        let (first, second) = {
            let files = DirectoryFileCollection::open(dir.path()).expect("open");
            let a = files.create_file(FileKind::TransactionLog, 0).expect("a");
            let b = files.create_file(FileKind::PureValues, 0).expect("b");
            files.append(b, b"value").expect("append");
            (a, b)
        };

        let files = DirectoryFileCollection::open(dir.path()).expect("reopen");
        let infos = files.file_infos();
        assert_eq!(infos.len(), 2);
        assert!(infos[&first].generation < infos[&second].generation);
        assert_eq!(files.size(second).expect("size"), 5);

        let c = files.create_file(FileKind::KeyIndex, 0).expect("c");
        assert!(c > second);
        let generation = files.file_info(c).expect("info").generation;
        assert!(generation > infos[&second].generation);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let dir = tempdir().expect("create temp dir");
        let files = DirectoryFileCollection::open(dir.path()).expect("open");
        let id = files.create_file(FileKind::PureValues, 0).expect("create");
        files.append(id, b"abc").expect("append");

        let mut buf = [0u8; 4];
        let result = files.read_at(id, &mut buf, 0);

        assert!(matches!(result, Err(FileError::ReadOutOfBounds { .. })));
    }

    #[test]
    fn test_soft_delete_then_purge() {
        let dir = tempdir().expect("create temp dir");
        let files = DirectoryFileCollection::open(dir.path()).expect("open");
        let id = files.create_file(FileKind::PureValues, 0).expect("create");
        let path = dir.path().join(format!("{id:08}.pvl"));

        files.mark_as_unknown(&[id]);
        assert!(files.file_info(id).is_none());
        assert!(path.exists(), "soft delete keeps the file");

        assert_eq!(files.delete_all_unknown_files().expect("purge"), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_header_is_unknown() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("00000003.trl");
        std::fs::write(&path, [0u8; 40]).expect("write junk");
        std::fs::write(dir.path().join("notes.txt"), b"keep me").expect("write other");

        let files = DirectoryFileCollection::open(dir.path()).expect("open");
        assert_eq!(files.count(), 0);
        assert_eq!(files.delete_all_unknown_files().expect("purge"), 1);
        assert!(!path.exists());
        assert!(dir.path().join("notes.txt").exists());

        let id = files.create_file(FileKind::TransactionLog, 0).expect("create");
        assert_eq!(id, 4);
    }
}
