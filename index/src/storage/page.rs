//! Fixed-size page buffer and the durable page header.
//!
//! Every page of every index file is 8KB. The first 28 bytes of a page are
//! the durable header shared by all page kinds:
//!
//! ```text
//! +--------+---------------------------------------------+
//! | 0-7    | magic (8 bytes)                             |
//! | 8-11   | CRC32 of bytes 12..PAGE_SIZE (4 bytes)      |
//! | 12-19  | journal segment of the last write (8 bytes) |
//! | 20-27  | journal LSN of the last write (8 bytes)     |
//! | 28-    | page body, layout owned by the page kind    |
//! +--------+---------------------------------------------+
//! ```
//!
//! All multi-byte integers are little-endian. Offsets passed to the accessors
//! are trusted: callers compute them from the layout constants of their page
//! kind, so an out-of-range offset is a programming error and panics.

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page index within one file (0-indexed).
pub type PageIndex = u64;

/// Magic value stamped into every page written by a checksumming store.
pub const PAGE_MAGIC: u64 = 0x4342_5452_4545_5047;

/// Byte offsets of the durable page header.
pub mod header {
    pub const MAGIC: usize = 0;
    pub const CRC32: usize = 8;
    pub const JOURNAL_SEGMENT: usize = 12;
    pub const JOURNAL_POSITION: usize = 20;
    /// First byte available to the page kind.
    pub const NEXT_FREE_POSITION: usize = 28;
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("magic", &self.read_u64(header::MAGIC))
            .field("checksum", &self.stored_checksum())
            .finish_non_exhaustive()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// Create a new zeroed page.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Create a page from a byte slice.
    ///
    /// Returns `None` unless the slice is exactly one page long.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAGE_SIZE {
            return None;
        }
        let mut page = Self::new();
        page.data.copy_from_slice(bytes);
        Some(page)
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Move `len` bytes from `from` to `to` inside the page. The ranges may overlap.
    pub fn move_bytes(&mut self, from: usize, to: usize, len: usize) {
        self.data.copy_within(from..from + len, to);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read an i16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write an i16 (little-endian) at the given offset.
    pub fn write_i16(&mut self, offset: usize, value: i16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an i32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.array(offset))
    }

    /// Write an i32 (little-endian) at the given offset.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an i64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.array(offset))
    }

    /// Write an i64 (little-endian) at the given offset.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[offset..offset + N]);
        out
    }

    /// True if no byte of the page was ever written.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Compute the CRC32 of everything after the checksum field.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[header::JOURNAL_SEGMENT..])
    }

    /// The checksum stored in the header.
    #[must_use]
    pub fn stored_checksum(&self) -> u32 {
        self.read_u32(header::CRC32)
    }

    /// Record the journal position of the write that produced this image.
    pub fn set_journal_position(&mut self, segment: u64, lsn: u64) {
        self.write_u64(header::JOURNAL_SEGMENT, segment);
        self.write_u64(header::JOURNAL_POSITION, lsn);
    }

    /// The journal LSN of the write that produced this image.
    #[must_use]
    pub fn journal_position(&self) -> u64 {
        self.read_u64(header::JOURNAL_POSITION)
    }

    /// Stamp the magic and a fresh checksum into the header.
    pub fn seal(&mut self) {
        self.write_u64(header::MAGIC, PAGE_MAGIC);
        let checksum = self.compute_checksum();
        self.write_u32(header::CRC32, checksum);
    }

    /// Check the magic and checksum written by [`Page::seal`].
    ///
    /// A page that was never written (all zeroes) is accepted.
    pub fn verify(&self) -> Result<(), ChecksumMismatch> {
        if self.read_u64(header::MAGIC) != PAGE_MAGIC {
            if self.is_zeroed() {
                return Ok(());
            }
            return Err(ChecksumMismatch {
                expected: self.stored_checksum(),
                actual: self.compute_checksum(),
            });
        }
        let actual = self.compute_checksum();
        let expected = self.stored_checksum();
        if actual == expected {
            Ok(())
        } else {
            Err(ChecksumMismatch { expected, actual })
        }
    }
}

/// A page whose header does not match its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub expected: u32,
    pub actual: u32,
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "page checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for ChecksumMismatch {}
