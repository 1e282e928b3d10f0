//! Buffered append writer over a [`FileCollection`] file.

use std::sync::Arc;

use crate::files::collection::{FileCollection, FileError, FileId};

const BUFFER_CAPACITY: usize = 64 * 1024;

/// Appends to one file, buffering small writes.
///
/// `position` counts every byte written, buffered or not, so callers can
/// record offsets before the data reaches the collection.
pub struct AppendWriter {
    files: Arc<dyn FileCollection>,
    file_id: FileId,
    buffer: Vec<u8>,
    position: u64,
}

impl AppendWriter {
    /// Start writing at the current end of `file_id`.
    pub fn new(files: Arc<dyn FileCollection>, file_id: FileId) -> Result<Self, FileError> {
        let position = files.size(file_id)?;
        Ok(Self {
            files,
            file_id,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            position,
        })
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Offset the next byte will be written at.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Append bytes, returning the offset of the first one.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, FileError> {
        let offset = self.position;
        if self.buffer.len() + data.len() > BUFFER_CAPACITY {
            self.flush_buffer()?;
        }
        if data.len() >= BUFFER_CAPACITY {
            self.files.append(self.file_id, data)?;
        } else {
            self.buffer.extend_from_slice(data);
        }
        self.position += data.len() as u64;
        Ok(offset)
    }

    /// Hand buffered bytes to the collection.
    pub fn flush_buffer(&mut self) -> Result<(), FileError> {
        if !self.buffer.is_empty() {
            self.files.append(self.file_id, &self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Hand buffered bytes to the collection and make them durable.
    pub fn hard_flush(&mut self) -> Result<(), FileError> {
        self.flush_buffer()?;
        self.files.flush(self.file_id)
    }

    /// Durably flush and drop storage past the written size.
    pub fn finish(mut self) -> Result<u64, FileError> {
        self.hard_flush()?;
        self.files.truncate(self.file_id)?;
        Ok(self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::collection::FileKind;
    use crate::files::memory::MemoryFileCollection;

    #[test]
    fn test_positions_include_buffered_bytes() {
        let files: Arc<dyn FileCollection> = Arc::new(MemoryFileCollection::new());
        let id = files.create_file(FileKind::PureValues, 0).expect("create");
        let mut writer = AppendWriter::new(Arc::clone(&files), id).expect("writer");

        assert_eq!(writer.write(b"abc").expect("write"), 0);
        assert_eq!(writer.write(b"defg").expect("write"), 3);
        assert_eq!(writer.position(), 7);
        assert_eq!(files.size(id).expect("size"), 0, "still buffered");

        writer.hard_flush().expect("flush");
        let mut buf = [0u8; 7];
        files.read_at(id, &mut buf, 0).expect("read");
        assert_eq!(&buf, b"abcdefg");
    }

    #[test]
    fn test_large_write_bypasses_buffer() {
        let files: Arc<dyn FileCollection> = Arc::new(MemoryFileCollection::new());
        let id = files.create_file(FileKind::PureValues, 0).expect("create");
        let mut writer = AppendWriter::new(Arc::clone(&files), id).expect("writer");
        let big = vec![7u8; BUFFER_CAPACITY + 10];

        writer.write(b"x").expect("small");
        let offset = writer.write(&big).expect("big");

        assert_eq!(offset, 1);
        assert_eq!(files.size(id).expect("size"), big.len() as u64 + 1);
        assert_eq!(writer.finish().expect("finish"), big.len() as u64 + 1);
    }
}
