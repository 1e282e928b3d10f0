//! Little-endian cursor over an in-memory file image.
//!
//! Every getter returns `None` when the buffer ends early, which callers
//! treat as a torn or truncated file.

pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub const fn position(&self) -> usize {
        self.pos
    }

    pub const fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    /// A `u32` length prefix followed by that many bytes.
    pub fn prefixed(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.u32()?).ok()?;
        self.bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_in_order() {
        let mut data = Vec::new();
        data.push(9u8);
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&(-3i64).to_le_bytes());
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(b"hi");

        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.u8(), Some(9));
        assert_eq!(reader.u32(), Some(7));
        assert_eq!(reader.i64(), Some(-3));
        assert_eq!(reader.prefixed(), Some(&b"hi"[..]));
        assert!(reader.is_at_end());
    }

    #[test]
    fn test_truncated_read_returns_none() {
        let data = [1u8, 2, 3];
        let mut reader = ByteReader::new(&data);

        assert_eq!(reader.u32(), None);
        assert_eq!(reader.position(), 0);
    }
}
