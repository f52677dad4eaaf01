//! Page-image journal.
//!
//! Atomic operations are made durable by journaling full page images before
//! they are applied to the page store. The journal is an append-only file:
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-7      | magic (8 bytes)                                  |
//! | 8-15     | start LSN (8 bytes)                              |
//! +----------+--------------------------------------------------+
//! | records, each:                                              |
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | operation_id (8 bytes)                           |
//! | 13-20    | lsn (8 bytes) - Log Sequence Number              |
//! | 21-N     | payload (variable, depends on type)              |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! LSNs are consecutive starting at the header's start LSN. Reading stops at
//! the first record that is torn, fails its checksum, or breaks the sequence,
//! so a crash mid-append loses only the incomplete operation.

// record_length fits in u32, page images are bounded by PAGE_SIZE
#![allow(clippy::cast_possible_truncation)]

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::storage::page::PageIndex;

/// Log Sequence Number - monotonically increasing identifier for log records.
pub type Lsn = u64;

const JOURNAL_MAGIC: u64 = 0x4342_5452_4545_4A4C;

/// Journal file header: magic (8) + start LSN (8).
const FILE_HEADER_SIZE: u64 = 16;

/// `record_length` (4) + `record_type` (1) + `operation_id` (8) + lsn (8) = 21 bytes
const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// A file the journal can live in.
pub trait LogFile: Read + Write + Seek {
    /// Make written bytes durable.
    fn sync_data(&mut self) -> std::io::Result<()>;

    /// Cut the file to `len` bytes.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for File {
    fn sync_data(&mut self) -> std::io::Result<()> {
        File::sync_data(&*self)
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl<T: LogFile + ?Sized> LogFile for Box<T> {
    fn sync_data(&mut self) -> std::io::Result<()> {
        (**self).sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        (**self).truncate(len)
    }
}

impl LogFile for Cursor<Vec<u8>> {
    fn sync_data(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        let len = usize::try_from(len).map_err(std::io::Error::other)?;
        self.get_mut().truncate(len);
        Ok(())
    }
}

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Atomic operation begin marker.
    Begin = 0x01,
    /// Full image of one page written by the operation.
    PageImage = 0x02,
    /// Atomic operation commit marker.
    Commit = 0x03,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Begin),
            0x02 => Ok(Self::PageImage),
            0x03 => Ok(Self::Commit),
            _ => Err(value),
        }
    }
}

/// Payload for different log record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordPayload {
    /// Begin operation - no additional data.
    Begin,
    /// Page image keyed by file name, so replay does not depend on file ids.
    PageImage {
        file_name: String,
        page_index: PageIndex,
        image: Vec<u8>,
    },
    /// Commit operation - no additional data.
    Commit,
}

impl LogRecordPayload {
    /// Get the record type for this payload.
    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin => LogRecordType::Begin,
            Self::PageImage { .. } => LogRecordType::PageImage,
            Self::Commit => LogRecordType::Commit,
        }
    }

    /// Serialize the payload to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Begin | Self::Commit => Vec::new(),
            Self::PageImage {
                file_name,
                page_index,
                image,
            } => {
                let mut bytes = Vec::with_capacity(2 + file_name.len() + 8 + image.len());
                bytes.extend_from_slice(&(file_name.len() as u16).to_le_bytes());
                bytes.extend_from_slice(file_name.as_bytes());
                bytes.extend_from_slice(&page_index.to_le_bytes());
                bytes.extend_from_slice(image);
                bytes
            }
        }
    }

    /// Deserialize a payload from bytes.
    pub fn from_bytes(record_type: LogRecordType, bytes: &[u8]) -> Result<Self, WalError> {
        match record_type {
            LogRecordType::Begin => Ok(Self::Begin),
            LogRecordType::Commit => Ok(Self::Commit),
            LogRecordType::PageImage => {
                if bytes.len() < 2 {
                    return Err(WalError::CorruptRecord);
                }
                let name_len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
                let index_start = 2 + name_len;
                if bytes.len() < index_start + 8 {
                    return Err(WalError::CorruptRecord);
                }
                let file_name = std::str::from_utf8(&bytes[2..index_start])
                    .map_err(|_| WalError::CorruptRecord)?
                    .to_string();
                let mut index_bytes = [0u8; 8];
                index_bytes.copy_from_slice(&bytes[index_start..index_start + 8]);
                Ok(Self::PageImage {
                    file_name,
                    page_index: u64::from_le_bytes(index_bytes),
                    image: bytes[index_start + 8..].to_vec(),
                })
            }
        }
    }
}

/// A complete log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Atomic operation that wrote this record.
    pub operation_id: u64,
    /// Log Sequence Number (position in the log).
    pub lsn: Lsn,
    /// The record payload.
    pub payload: LogRecordPayload,
}

impl LogRecord {
    /// Serialize this record to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_bytes = self.payload.to_bytes();
        let total_len = RECORD_HEADER_SIZE + payload_bytes.len() + CHECKSUM_SIZE;

        let mut bytes = Vec::with_capacity(total_len);
        bytes.extend_from_slice(&(total_len as u32).to_le_bytes());
        bytes.push(self.payload.record_type() as u8);
        bytes.extend_from_slice(&self.operation_id.to_le_bytes());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&payload_bytes);

        // CRC32 checksum (4 bytes) - computed over everything before it
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());

        bytes
    }

    /// Deserialize a record from bytes.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        if bytes.len() < RECORD_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(WalError::CorruptRecord);
        }

        let record_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if record_len < RECORD_HEADER_SIZE + CHECKSUM_SIZE || record_len > bytes.len() {
            return Err(WalError::CorruptRecord);
        }

        let stored_checksum = u32::from_le_bytes([
            bytes[record_len - 4],
            bytes[record_len - 3],
            bytes[record_len - 2],
            bytes[record_len - 1],
        ]);
        let computed_checksum = crc32fast::hash(&bytes[..record_len - CHECKSUM_SIZE]);
        if stored_checksum != computed_checksum {
            return Err(WalError::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let record_type = LogRecordType::try_from(bytes[4]).map_err(WalError::InvalidRecordType)?;
        let operation_id = read_u64(&bytes[5..13]);
        let lsn = read_u64(&bytes[13..21]);

        let payload_bytes = &bytes[RECORD_HEADER_SIZE..record_len - CHECKSUM_SIZE];
        let payload = LogRecordPayload::from_bytes(record_type, payload_bytes)?;

        Ok((
            Self {
                operation_id,
                lsn,
                payload,
            },
            record_len,
        ))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(out)
}

/// Append-only journal of page images.
pub struct Wal<F: LogFile> {
    file: F,
    /// LSN of the first record after the header.
    start_lsn: Lsn,
    /// Next LSN to assign.
    next_lsn: Lsn,
    /// Byte offset of the next append.
    head: u64,
}

impl<F: LogFile> Wal<F> {
    /// Open a journal, initializing the header if the file is empty.
    ///
    /// An existing journal is scanned to find the end of its valid records;
    /// anything after a torn record is cut off.
    pub fn open(mut file: F) -> Result<Self, WalError> {
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            let mut wal = Self {
                file,
                start_lsn: 1,
                next_lsn: 1,
                head: FILE_HEADER_SIZE,
            };
            wal.write_header()?;
            return Ok(wal);
        }

        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header).map_err(|_| WalError::BadHeader)?;
        if read_u64(&header[0..8]) != JOURNAL_MAGIC {
            return Err(WalError::BadHeader);
        }
        let start_lsn = read_u64(&header[8..16]);

        let mut wal = Self {
            file,
            start_lsn,
            next_lsn: start_lsn,
            head: FILE_HEADER_SIZE,
        };
        let (records, end) = wal.scan()?;
        wal.next_lsn = start_lsn + records.len() as u64;
        wal.head = end;
        if end < len {
            wal.file.truncate(end)?;
        }
        Ok(wal)
    }

    fn write_header(&mut self) -> Result<(), WalError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&JOURNAL_MAGIC.to_le_bytes())?;
        self.file.write_all(&self.start_lsn.to_le_bytes())?;
        Ok(())
    }

    /// Parse valid records from the header on; returns them and the end offset.
    fn scan(&mut self) -> Result<(Vec<LogRecord>, u64), WalError> {
        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut expected_lsn = self.start_lsn;
        while offset < bytes.len() {
            let Ok((record, consumed)) = LogRecord::from_bytes(&bytes[offset..]) else {
                break;
            };
            if record.lsn != expected_lsn {
                break;
            }
            expected_lsn += 1;
            offset += consumed;
            records.push(record);
        }
        Ok((records, FILE_HEADER_SIZE + offset as u64))
    }

    /// Get the next LSN that will be assigned.
    #[must_use]
    pub const fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Bytes in the journal, header included.
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.head
    }

    /// Check if the journal holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.next_lsn == self.start_lsn
    }

    /// Append a log record, returning the LSN assigned to it.
    pub fn append(&mut self, operation_id: u64, payload: LogRecordPayload) -> Result<Lsn, WalError> {
        let lsn = self.next_lsn;
        let record = LogRecord {
            operation_id,
            lsn,
            payload,
        };
        let bytes = record.to_bytes();

        self.file.seek(SeekFrom::Start(self.head))?;
        self.file.write_all(&bytes)?;

        self.head += bytes.len() as u64;
        self.next_lsn += 1;
        Ok(lsn)
    }

    /// Flush and sync the journal.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read all valid records.
    pub fn read_all(&mut self) -> Result<Vec<LogRecord>, WalError> {
        Ok(self.scan()?.0)
    }

    /// Drop every record, continuing the LSN sequence from where it stopped.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.start_lsn = self.next_lsn;
        self.head = FILE_HEADER_SIZE;
        self.file.truncate(FILE_HEADER_SIZE)?;
        self.write_header()?;
        self.sync()
    }

    /// Consume the journal, returning the underlying file.
    pub fn into_inner(self) -> F {
        self.file
    }
}

/// Errors that can occur during journal operations.
#[derive(Debug)]
pub enum WalError {
    /// I/O error.
    Io(std::io::Error),
    /// Corrupt log record.
    CorruptRecord,
    /// Invalid record type byte.
    InvalidRecordType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Journal header missing or not a journal.
    BadHeader,
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "journal I/O error: {e}"),
            Self::CorruptRecord => write!(f, "corrupt journal record"),
            Self::InvalidRecordType(t) => write!(f, "invalid journal record type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "journal checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
            Self::BadHeader => write!(f, "journal header missing or invalid"),
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WalError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_image(name: &str, page_index: u64, fill: u8) -> LogRecordPayload {
        LogRecordPayload::PageImage {
            file_name: name.to_string(),
            page_index,
            image: vec![fill; 64],
        }
    }

    #[test]
    fn test_page_image_record_decodes() {
        let record = LogRecord {
            operation_id: 9,
            lsn: 3,
            payload: page_image("tree.cbt", 12, 0xAA),
        };

        let bytes = record.to_bytes();
        let (decoded, consumed) = LogRecord::from_bytes(&bytes).expect("decode");

        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checksum_validation() {
        let record = LogRecord {
            operation_id: 1,
            lsn: 1,
            payload: LogRecordPayload::Begin,
        };

        let mut bytes = record.to_bytes();
        bytes[5] ^= 0xFF;

        let result = LogRecord::from_bytes(&bytes);
        assert!(matches!(result, Err(WalError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_append_and_reopen() {
        let mut wal = Wal::open(Cursor::new(Vec::new())).expect("open journal");
        wal.append(1, LogRecordPayload::Begin).expect("append");
        wal.append(1, page_image("a", 0, 1)).expect("append");
        wal.append(1, LogRecordPayload::Commit).expect("append");
        assert_eq!(wal.next_lsn(), 4);

        let mut wal = Wal::open(wal.into_inner()).expect("reopen journal");
        assert_eq!(wal.next_lsn(), 4);
        let records = wal.read_all().expect("read");
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2].payload, LogRecordPayload::Commit));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let mut wal = Wal::open(Cursor::new(Vec::new())).expect("open journal");
        wal.append(1, LogRecordPayload::Begin).expect("append");
        wal.append(1, page_image("a", 0, 1)).expect("append");

        let mut cursor = wal.into_inner();
        let len = cursor.get_ref().len();
        cursor.get_mut().truncate(len - 10);

        let mut wal = Wal::open(cursor).expect("reopen journal");
        assert_eq!(wal.read_all().expect("read").len(), 1);
        assert_eq!(wal.next_lsn(), 2);

        wal.append(1, LogRecordPayload::Commit).expect("append after torn tail");
        assert_eq!(wal.read_all().expect("read").len(), 2);
    }

    #[test]
    fn test_reset_keeps_lsn_sequence() {
        let mut wal = Wal::open(Cursor::new(Vec::new())).expect("open journal");
        wal.append(1, LogRecordPayload::Begin).expect("append");
        wal.append(1, LogRecordPayload::Commit).expect("append");

        wal.reset().expect("reset");
        assert!(wal.is_empty());
        assert_eq!(wal.next_lsn(), 3);

        let lsn = wal.append(2, LogRecordPayload::Begin).expect("append");
        assert_eq!(lsn, 3);

        let mut wal = Wal::open(wal.into_inner()).expect("reopen journal");
        let records = wal.read_all().expect("read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_id, 2);
    }

    #[test]
    fn test_bad_header_rejected() {
        let cursor = Cursor::new(vec![0xFFu8; 32]);
        assert!(matches!(Wal::open(cursor), Err(WalError::BadHeader)));
    }

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(LogRecordType::try_from(0x02), Ok(LogRecordType::PageImage));
        assert_eq!(LogRecordType::try_from(0x7F), Err(0x7F));
    }
}
