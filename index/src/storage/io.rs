//! Page store abstraction.
//!
//! A `PageStore` owns a set of named files, each a dense array of 8KB pages.
//! The index never talks to the OS directly: the file-backed store is used in
//! production and the in-memory store (with optional fault injection) in
//! tests.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `read_page` returns the last written content for a page
//! - `write_page` at `filled_up_to` or beyond extends the file, zero-filling
//!   any gap
//! - `sync` makes all previous writes durable
//! - file ids stay stable while a file is open

use crate::storage::page::{ChecksumMismatch, Page, PageIndex};
use crate::storage::wal::WalError;

/// Identifier of an open file inside a page store.
pub type FileId = u64;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// No open file has this id.
    UnknownFile(FileId),
    /// No file has this name.
    FileNotFound(String),
    /// A file with this name already exists.
    FileExists(String),
    /// Page out of bounds.
    PageOutOfBounds {
        file_id: FileId,
        page_index: PageIndex,
        filled_up_to: u64,
    },
    /// Stored page failed its checksum.
    Checksum {
        file_id: FileId,
        page_index: PageIndex,
        mismatch: ChecksumMismatch,
    },
    /// The page is already held for write by the same atomic operation.
    PageAlreadyPinned {
        file_id: FileId,
        page_index: PageIndex,
    },
    /// The calling thread already holds the component's exclusive latch
    /// through another operation and would wait on itself.
    LatchHeldByThread {
        component: String,
        holder: u64,
        requester: u64,
    },
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Journal error.
    Wal(WalError),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownFile(id) => write!(f, "file {id} is not open"),
            Self::FileNotFound(name) => write!(f, "file '{name}' not found"),
            Self::FileExists(name) => write!(f, "file '{name}' already exists"),
            Self::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to,
            } => write!(
                f,
                "page {page_index} of file {file_id} out of bounds (filled up to: {filled_up_to})"
            ),
            Self::Checksum {
                file_id,
                page_index,
                mismatch,
            } => write!(f, "page {page_index} of file {file_id}: {mismatch}"),
            Self::PageAlreadyPinned {
                file_id,
                page_index,
            } => write!(
                f,
                "page {page_index} of file {file_id} is already loaded for write"
            ),
            Self::LatchHeldByThread {
                component,
                holder,
                requester,
            } => write!(
                f,
                "latch of '{component}' is held by operation {holder} on this thread, \
                 operation {requester} cannot wait for it"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Wal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Checksum { mismatch, .. } => Some(mismatch),
            Self::Wal(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WalError> for StorageError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

/// Abstraction over page-based file storage.
///
/// Shared between the atomic operations manager and readers, so all methods
/// take `&self` and implementations synchronize internally.
pub trait PageStore: Send + Sync {
    /// Create a new empty file.
    fn add_file(&self, name: &str) -> Result<FileId, StorageError>;

    /// Open an existing file, returning its id.
    ///
    /// Opening an already open file returns the same id.
    fn open_file(&self, name: &str) -> Result<FileId, StorageError>;

    /// Check whether a file with this name exists.
    fn exists(&self, name: &str) -> bool;

    /// Remove a file and its pages.
    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError>;

    /// Flush and close a file. Its id becomes invalid.
    fn close_file(&self, file_id: FileId) -> Result<(), StorageError>;

    /// Name of an open file.
    fn file_name(&self, file_id: FileId) -> Result<String, StorageError>;

    /// Number of pages in the file.
    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError>;

    /// Read a page.
    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError>;

    /// Write a page, extending the file if needed.
    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&self) -> Result<(), StorageError>;
}
