//! Per-file usage accounting for one compaction pass.

/// How much of a file the last committed version still uses.
///
/// # Invariants
/// - `live_value_length <= total_length` once accounting is complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    total_length: u32,
    live_value_length: u32,
    forbid_to_delete: bool,
}

impl FileStat {
    /// Stat of a candidate file of `total_length` bytes, nothing live yet.
    #[must_use]
    pub const fn new(total_length: u32) -> Self {
        Self {
            total_length,
            live_value_length: 0,
            forbid_to_delete: false,
        }
    }

    /// Account `length` more live value bytes.
    pub const fn add_length(&mut self, length: u32) {
        self.live_value_length = self.live_value_length.saturating_add(length);
    }

    /// Bytes that compaction would reclaim. Files with nothing live are
    /// handled as useless instead, so they report no waste.
    #[must_use]
    pub const fn waste(&self) -> u32 {
        if self.total_length == 0 || self.live_value_length == 0 {
            return 0;
        }
        self.total_length.saturating_sub(self.live_value_length)
    }

    /// Whether the file can be dropped outright.
    #[must_use]
    pub const fn is_useless(&self) -> bool {
        self.total_length != 0 && self.live_value_length == 0 && !self.forbid_to_delete
    }

    /// Live bytes that relocating this file would copy.
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.live_value_length
    }

    pub const fn mark_forbid_to_delete(&mut self) {
        self.forbid_to_delete = true;
    }

    #[must_use]
    pub const fn is_free_to_delete(&self) -> bool {
        !self.forbid_to_delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waste() {
        let mut stat = FileStat::new(1000);
        assert_eq!(stat.waste(), 0, "nothing live is useless, not wasteful");
        assert!(stat.is_useless());

        stat.add_length(300);
        assert_eq!(stat.waste(), 700);
        assert_eq!(stat.used(), 300);
        assert!(!stat.is_useless());
    }

    #[test]
    fn test_empty_file_is_neither_useless_nor_wasteful() {
        let stat = FileStat::new(0);
        assert_eq!(stat.waste(), 0);
        assert!(!stat.is_useless());
        assert_eq!(FileStat::default(), stat);
    }

    #[test]
    fn test_forbidden_file_is_not_useless() {
        let mut stat = FileStat::new(10);
        stat.mark_forbid_to_delete();

        assert!(!stat.is_useless());
        assert!(!stat.is_free_to_delete());
    }
}
