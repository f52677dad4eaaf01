//! Record locators, the value type stored in the index.

use crate::storage::page::Page;

/// Pointer to a stored record: partition id plus position inside it.
///
/// Encoded as 10 little-endian bytes: partition (i16) then position (i64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordLocator {
    pub partition: i16,
    pub position: i64,
}

impl RecordLocator {
    /// Size of the encoded locator in bytes.
    pub const ENCODED_SIZE: usize = 10;

    #[must_use]
    pub const fn new(partition: i16, position: i64) -> Self {
        Self {
            partition,
            position,
        }
    }

    /// Encode to the fixed 10-byte layout.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::ENCODED_SIZE] {
        let mut bytes = [0u8; Self::ENCODED_SIZE];
        bytes[0..2].copy_from_slice(&self.partition.to_le_bytes());
        bytes[2..10].copy_from_slice(&self.position.to_le_bytes());
        bytes
    }

    /// Decode from the fixed 10-byte layout.
    ///
    /// Returns `None` if fewer than 10 bytes are given.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_SIZE {
            return None;
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(&bytes[2..10]);
        Some(Self {
            partition: i16::from_le_bytes([bytes[0], bytes[1]]),
            position: i64::from_le_bytes(position),
        })
    }

    /// Read a locator stored at `offset` in a page.
    #[must_use]
    pub fn read_from(page: &Page, offset: usize) -> Self {
        Self {
            partition: page.read_i16(offset),
            position: page.read_i64(offset + 2),
        }
    }

    /// Write this locator at `offset` in a page.
    pub fn write_to(self, page: &mut Page, offset: usize) {
        page.write_i16(offset, self.partition);
        page.write_i64(offset + 2, self.position);
    }
}

impl std::fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.partition, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_layout() {
        let locator = RecordLocator::new(-2, 0x0102_0304_0506_0708);
        let bytes = locator.to_bytes();

        assert_eq!(&bytes[0..2], &(-2i16).to_le_bytes());
        assert_eq!(bytes[2], 0x08);
        assert_eq!(RecordLocator::from_bytes(&bytes), Some(locator));
    }

    #[test]
    fn test_short_input_rejected() {
        assert_eq!(RecordLocator::from_bytes(&[0u8; 9]), None);
    }

    #[test]
    fn test_page_access_matches_byte_encoding() {
        let locator = RecordLocator::new(12, -77);
        let mut page = Page::new();
        locator.write_to(&mut page, 29);

        assert_eq!(page.read_bytes(29, 10), &locator.to_bytes());
        assert_eq!(RecordLocator::read_from(&page, 29), locator);
    }

    #[test]
    fn test_display() {
        assert_eq!(RecordLocator::new(3, 15).to_string(), "#3:15");
    }
}
