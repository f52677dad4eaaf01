//! Page storage underneath the index: page buffers, page stores, the
//! page-image journal, and atomic operations.

pub mod atomic;
pub mod checkpoint;
pub mod file;
pub mod io;
pub mod memory;
pub mod page;
pub mod recovery;
pub mod wal;

pub use atomic::{
    AtomicOperation, AtomicOperationsManager, ComponentReadGuard, PageSource, ReadEntry,
    WriteEntry,
};
pub use checkpoint::CheckpointConfig;
pub use file::FilePageStore;
pub use io::{FileId, PageStore, StorageError};
pub use memory::{FaultConfig, MemoryPageStore};
pub use page::{PAGE_SIZE, Page, PageIndex};
pub use recovery::RecoveryResult;
pub use wal::{LogFile, Wal, WalError};
