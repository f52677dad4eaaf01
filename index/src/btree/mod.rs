//! The single-value B+-tree: page overlays, the tree controller, and its
//! cursors.

pub mod bucket;
pub mod cursor;
pub mod entry_point;
pub mod null_bucket;
pub mod tree;
pub mod validator;

pub use cursor::{Cursor, Direction};
pub use tree::{DATA_FILE_EXTENSION, IndexError, NULL_FILE_EXTENSION, SingleValueTree};
pub use validator::{KeepExisting, UniqueValue, Validation, ValidationError, Validator};
