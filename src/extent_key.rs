//! Extent keys: where a range of a file's bytes physically lives.

use serde::{Deserialize, Serialize};

/// The atomic unit of file-range addressing. A file is a sparse, ordered
/// sequence of these; each one names a byte range of an extent on a data
/// partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Logical offset of this range within the file.
    pub file_offset: u64,
    /// Data partition holding the extent. Zero while an append is still in
    /// flight and no extent has been allocated yet.
    pub partition_id: u64,
    /// Extent within the partition. Zero carries the same in-flight meaning
    /// as a zero partition id.
    pub extent_id: u64,
    /// Byte offset of the range inside the extent.
    pub extent_offset: u64,
    /// Length of the range.
    pub size: u32,
    /// CRC32 of the range as last written, zero when unknown.
    pub crc: u32,
}

impl ExtentKey {
    /// One past the last file offset this key covers.
    pub fn end(&self) -> u64 {
        self.file_offset + self.size as u64
    }

    /// Keys without a real partition or extent mark an append that has not
    /// yet reached the meta service. They are kept visible locally so
    /// concurrent readers do not see a hole.
    pub fn is_temporary(&self) -> bool {
        self.partition_id == 0 || self.extent_id == 0
    }

    /// Whether `[offset, offset + len)` lies entirely within this key.
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.file_offset && offset + len <= self.end()
    }

    /// Offset within the extent corresponding to file offset `offset`,
    /// which must fall inside this key.
    pub fn extent_offset_at(&self, offset: u64) -> u64 {
        debug_assert!(offset >= self.file_offset && offset < self.end());
        self.extent_offset + (offset - self.file_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file_offset: u64, size: u32) -> ExtentKey {
        ExtentKey {
            file_offset,
            partition_id: 1,
            extent_id: 100,
            extent_offset: 0,
            size,
            crc: 0,
        }
    }

    #[test]
    fn coverage() {
        let k = key(100, 50);
        assert_eq!(k.end(), 150);
        assert!(k.covers(100, 50));
        assert!(k.covers(120, 10));
        assert!(!k.covers(90, 20));
        assert!(!k.covers(140, 20));
    }

    #[test]
    fn temporary_markers() {
        let mut k = key(0, 10);
        assert!(!k.is_temporary());
        k.partition_id = 0;
        assert!(k.is_temporary());
        k.partition_id = 1;
        k.extent_id = 0;
        assert!(k.is_temporary());
    }

    #[test]
    fn extent_offset_mapping() {
        let mut k = key(4096, 1024);
        k.extent_offset = 8192;
        assert_eq!(k.extent_offset_at(4096), 8192);
        assert_eq!(k.extent_offset_at(5000), 8192 + 904);
    }
}
