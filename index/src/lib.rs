//! Page-resident single-value B+-tree index.
//!
//! Layers, bottom up:
//! - `storage`: 8KB pages, page stores (file-backed and in-memory), the
//!   page-image journal, and atomic operations with component latches
//! - `key`: composite keys with boundary sentinels, and key codecs
//! - `btree`: bucket, null bucket and entry point page overlays, the tree
//!   controller, and range cursors
//!
//! A tree maps each key, plus an optional null key, to one
//! [`RecordLocator`]. Every mutation runs inside an atomic operation and
//! becomes durable when the operation commits.

pub mod btree;
pub mod config;
pub mod key;
pub mod record;
pub mod storage;

#[cfg(test)]
mod testing;

pub use btree::{Cursor, IndexError, SingleValueTree, Validation, Validator};
pub use config::{ConfigError, IndexConfig};
pub use key::{Key, KeyCodec, KeyType, Scalar};
pub use record::RecordLocator;
pub use storage::{AtomicOperation, AtomicOperationsManager};
