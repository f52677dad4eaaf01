//! Single-value B+-tree over pages.
//!
//! Every key maps to exactly one [`RecordLocator`]. The tree lives in two
//! files of the page store:
//! - `<name>.cbt`: entry point (page 0), root bucket (page 1, never moves),
//!   and every other bucket
//! - `<name>.nbt`: the null bucket (page 0), holding the value of the null key
//!
//! # Locking
//!
//! Readers take the shared component latch of the atomic operations manager
//! and read committed pages, or read through an operation (`get_in`,
//! `size_in`, [`Cursor::in_operation`]) to see its uncommitted writes.
//! Mutations take the exclusive latch until their operation completes and
//! read and write through the operation, so other readers never observe a
//! half-applied split. A thread may drive one writing operation per tree at
//! a time; a second operation on the same thread gets
//! [`StorageError::LatchHeldByThread`] instead of waiting on itself. The
//! tree's own state lock only guards the open file handles.
//!
//! # Splits
//!
//! Inserts record the page and slot at every level of the descent. When a
//! bucket overflows it is split at its median and the separator is pushed
//! onto an explicit stack of pending entries for the parent level, so split
//! propagation is iterative and bounded by the recorded path. The root page
//! index never changes: a root split moves both halves into new pages and
//! turns the root into an internal bucket with one separator.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::btree::bucket::{Bucket, BucketError};
use crate::btree::cursor::{Cursor, Direction};
use crate::btree::entry_point::EntryPoint;
use crate::btree::null_bucket::NullBucket;
use crate::btree::validator::{Validation, ValidationError, Validator};
use crate::config::{ConfigError, IndexConfig};
use crate::key::{Key, KeyCodec, KeyCodecError, KeyType, PartialSearchMode};
use crate::record::RecordLocator;
use crate::storage::{
    AtomicOperation, AtomicOperationsManager, FileId, PageIndex, PageSource, ReadEntry,
    StorageError, WriteEntry,
};

/// Extension of the data file.
pub const DATA_FILE_EXTENSION: &str = ".cbt";
/// Extension of the null-key file.
pub const NULL_FILE_EXTENSION: &str = ".nbt";

const ENTRY_POINT_INDEX: PageIndex = 0;
const ROOT_INDEX: PageIndex = 1;
const NULL_BUCKET_INDEX: PageIndex = 0;

/// File handles and key shape of an open tree.
#[derive(Debug, Clone)]
struct TreeState {
    file_id: FileId,
    null_file_id: FileId,
    key_arity: usize,
    key_types: Option<Vec<KeyType>>,
}

/// One level of a recorded descent: the page visited and the slot an entry
/// for that level would be inserted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PathItem {
    page: PageIndex,
    slot: usize,
}

/// An entry waiting to be inserted at some level of the recorded path.
enum PendingEntry {
    Leaf {
        key: Vec<u8>,
        value: [u8; RecordLocator::ENCODED_SIZE],
    },
    Separator {
        left: PageIndex,
        right: PageIndex,
        key: Vec<u8>,
        /// The entry retried below this separator went to `right`.
        went_right: bool,
    },
}

/// Result of descending to a leaf.
struct LeafSearch<'s> {
    page: PageIndex,
    bucket: Bucket<ReadEntry<'s>>,
    found: Result<usize, usize>,
}

/// A page-resident B+-tree mapping keys to record locators.
pub struct SingleValueTree<C> {
    name: String,
    manager: Arc<AtomicOperationsManager>,
    codec: C,
    config: IndexConfig,
    state: RwLock<Option<TreeState>>,
}

impl<C: KeyCodec> SingleValueTree<C> {
    /// Create a handle for the tree called `name`. The tree must be
    /// [created](Self::create) or [loaded](Self::load) before use.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Config`] if `config` fails
    /// [`IndexConfig::validate`].
    pub fn new(
        name: impl Into<String>,
        manager: Arc<AtomicOperationsManager>,
        codec: C,
        config: IndexConfig,
    ) -> Result<Self, IndexError> {
        let name = name.into();
        if let Err(source) = config.validate() {
            return Err(IndexError::Config {
                component: name,
                source,
            });
        }
        Ok(Self {
            name,
            manager,
            codec,
            config,
            state: RwLock::new(None),
        })
    }

    /// Component name, also the base name of both files.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub const fn codec(&self) -> &C {
        &self.codec
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<AtomicOperationsManager> {
        &self.manager
    }

    /// Whether the tree has been created or loaded and not yet closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.read_state().is_some()
    }

    fn data_file_name(&self) -> String {
        format!("{}{DATA_FILE_EXTENSION}", self.name)
    }

    fn null_file_name(&self) -> String {
        format!("{}{NULL_FILE_EXTENSION}", self.name)
    }

    /// Create both files and initialize the entry point, an empty root leaf
    /// and an empty null bucket.
    pub fn create(
        &self,
        op: &AtomicOperation<'_>,
        key_types: Option<Vec<KeyType>>,
        key_arity: usize,
    ) -> Result<(), IndexError> {
        self.manager
            .acquire_exclusive_lock_till_operation_complete(op, &self.name)
            .context(&self.name)?;
        let mut state = self.write_state();

        let file_id = op.add_file(&self.data_file_name()).context(&self.name)?;
        let null_file_id = op.add_file(&self.null_file_name()).context(&self.name)?;

        EntryPoint::new(op.add_page(file_id).context(&self.name)?).init();
        Bucket::new(op.add_page(file_id).context(&self.name)?).init(true);
        NullBucket::new(op.add_page(null_file_id).context(&self.name)?).init();

        *state = Some(TreeState {
            file_id,
            null_file_id,
            key_arity: key_arity.max(1),
            key_types,
        });
        tracing::info!(component = %self.name, key_arity, "index created");
        Ok(())
    }

    /// Open the files of an existing tree.
    pub fn load(&self, key_types: Option<Vec<KeyType>>, key_arity: usize) -> Result<(), IndexError> {
        let mut state = self.write_state();
        let store = self.manager.store();
        let file_id = store.open_file(&self.data_file_name()).context(&self.name)?;
        let null_file_id = store.open_file(&self.null_file_name()).context(&self.name)?;

        *state = Some(TreeState {
            file_id,
            null_file_id,
            key_arity: key_arity.max(1),
            key_types,
        });
        tracing::info!(component = %self.name, key_arity, "index loaded");
        Ok(())
    }

    /// Delete both files when `op` commits. The handle is closed at once.
    pub fn delete(&self, op: &AtomicOperation<'_>) -> Result<(), IndexError> {
        self.manager
            .acquire_exclusive_lock_till_operation_complete(op, &self.name)
            .context(&self.name)?;
        let mut state = self.write_state();
        let (file_id, null_file_id) = {
            let current = Self::opened(&self.name, state.as_ref())?;
            (current.file_id, current.null_file_id)
        };

        op.delete_file(file_id).context(&self.name)?;
        op.delete_file(null_file_id).context(&self.name)?;

        *state = None;
        tracing::info!(component = %self.name, "index deleted");
        Ok(())
    }

    /// Close both files. Closing a tree that is not open does nothing.
    pub fn close(&self) -> Result<(), IndexError> {
        let mut state = self.write_state();
        let Some(current) = state.take() else {
            return Ok(());
        };
        let store = self.manager.store();
        store.close_file(current.file_id).context(&self.name)?;
        store.close_file(current.null_file_id).context(&self.name)?;
        tracing::info!(component = %self.name, "index closed");
        Ok(())
    }

    /// Hold the exclusive component latch until `op` completes.
    ///
    /// # Errors
    ///
    /// Fails if another operation of this thread holds the latch.
    pub fn acquire_atomic_exclusive_lock(&self, op: &AtomicOperation<'_>) -> Result<(), IndexError> {
        self.manager
            .acquire_exclusive_lock_till_operation_complete(op, &self.name)
            .context(&self.name)
    }

    /// Look up the committed value stored under `key`. `None` is the null
    /// key.
    pub fn get(&self, key: Option<&Key>) -> Result<Option<RecordLocator>, IndexError> {
        self.read_with(None, |source, state| self.lookup(source, state, key))
    }

    /// Look up the value stored under `key` as `op` sees it, its own
    /// uncommitted writes included.
    pub fn get_in(
        &self,
        op: &AtomicOperation<'_>,
        key: Option<&Key>,
    ) -> Result<Option<RecordLocator>, IndexError> {
        self.read_with(Some(op), |source, state| self.lookup(source, state, key))
    }

    /// Number of committed entries, the null key included.
    pub fn size(&self) -> Result<u64, IndexError> {
        self.read_with(None, |source, state| self.tree_size(source, state))
    }

    /// Number of entries as `op` sees them.
    pub fn size_in(&self, op: &AtomicOperation<'_>) -> Result<u64, IndexError> {
        self.read_with(Some(op), |source, state| self.tree_size(source, state))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(
        &self,
        op: &AtomicOperation<'_>,
        key: Option<Key>,
        value: RecordLocator,
    ) -> Result<(), IndexError> {
        self.update(op, key, value, None).map(|_| ())
    }

    /// Store `value` under `key` after `validator` has seen the previous and
    /// the new value.
    ///
    /// Returns `Ok(false)` without touching the tree when the validator
    /// answers [`Validation::Ignore`].
    pub fn validated_put(
        &self,
        op: &AtomicOperation<'_>,
        key: Option<Key>,
        value: RecordLocator,
        validator: &dyn Validator,
    ) -> Result<bool, IndexError> {
        self.update(op, key, value, Some(validator))
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(
        &self,
        op: &AtomicOperation<'_>,
        key: Option<&Key>,
    ) -> Result<Option<RecordLocator>, IndexError> {
        self.manager
            .acquire_exclusive_lock_till_operation_complete(op, &self.name)
            .context(&self.name)?;
        let state = self.read_state();
        let state = Self::opened(&self.name, state.as_ref())?;

        let Some(key) = key else {
            return self.remove_null(op, state);
        };
        let key = self.preprocess(state, key.clone());

        let (page, found) = {
            let search = self.find_leaf(op, state, &key)?;
            (search.page, search.found)
        };
        let Ok(index) = found else {
            return Ok(None);
        };

        let mut bucket = Bucket::new(op.load_for_write(state.file_id, page).context(&self.name)?);
        let raw_key = bucket.raw_key(index, &self.codec).context(&self.name)?;
        let removed = bucket.value(index, &self.codec).context(&self.name)?;
        bucket.remove_leaf_entry(index, &raw_key).context(&self.name)?;
        drop(bucket);

        self.update_size(op, state, -1)?;
        Ok(Some(removed))
    }

    /// Smallest committed key, if any.
    pub fn first_key(&self) -> Result<Option<Key>, IndexError> {
        self.read_with(None, |source, state| {
            let item = self.first_item(source, state)?;
            self.key_at(source, state, item)
        })
    }

    /// Smallest key as `op` sees it.
    pub fn first_key_in(&self, op: &AtomicOperation<'_>) -> Result<Option<Key>, IndexError> {
        self.read_with(Some(op), |source, state| {
            let item = self.first_item(source, state)?;
            self.key_at(source, state, item)
        })
    }

    /// Largest committed key, if any.
    pub fn last_key(&self) -> Result<Option<Key>, IndexError> {
        self.read_with(None, |source, state| {
            let item = self.last_item(source, state)?;
            self.key_at(source, state, item)
        })
    }

    /// Largest key as `op` sees it.
    pub fn last_key_in(&self, op: &AtomicOperation<'_>) -> Result<Option<Key>, IndexError> {
        self.read_with(Some(op), |source, state| {
            let item = self.last_item(source, state)?;
            self.key_at(source, state, item)
        })
    }

    /// Every non-null key in ascending order.
    pub fn key_stream(&self) -> impl Iterator<Item = Result<Key, IndexError>> + '_ {
        self.all_entries().map(|entry| entry.map(|(key, _)| key))
    }

    /// Every non-null entry in ascending order.
    ///
    /// Cursors read committed state; [`Cursor::in_operation`] makes them
    /// read through an operation instead.
    #[must_use]
    pub fn all_entries(&self) -> Cursor<'_, C> {
        Cursor::new(self, Bound::Unbounded, Bound::Unbounded, Direction::Ascending)
    }

    /// Entries with keys below `to`.
    ///
    /// A key shorter than the tree's arity matches every key it prefixes.
    pub fn iterate_entries_minor(
        &self,
        to: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> Result<Cursor<'_, C>, IndexError> {
        let to = {
            let state = self.read_state();
            let state = Self::opened(&self.name, state.as_ref())?;
            self.boundary(state, to, Self::upper_mode(inclusive))
        };
        Ok(Cursor::new(
            self,
            Bound::Unbounded,
            Self::bound(to, inclusive),
            Direction::from_ascending(ascending),
        ))
    }

    /// Entries with keys above `from`.
    pub fn iterate_entries_major(
        &self,
        from: &Key,
        inclusive: bool,
        ascending: bool,
    ) -> Result<Cursor<'_, C>, IndexError> {
        let from = {
            let state = self.read_state();
            let state = Self::opened(&self.name, state.as_ref())?;
            self.boundary(state, from, Self::lower_mode(inclusive))
        };
        Ok(Cursor::new(
            self,
            Self::bound(from, inclusive),
            Bound::Unbounded,
            Direction::from_ascending(ascending),
        ))
    }

    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: &Key,
        from_inclusive: bool,
        to: &Key,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<Cursor<'_, C>, IndexError> {
        let (from, to) = {
            let state = self.read_state();
            let state = Self::opened(&self.name, state.as_ref())?;
            (
                self.boundary(state, from, Self::lower_mode(from_inclusive)),
                self.boundary(state, to, Self::upper_mode(to_inclusive)),
            )
        };
        Ok(Cursor::new(
            self,
            Self::bound(from, from_inclusive),
            Self::bound(to, to_inclusive),
            Direction::from_ascending(ascending),
        ))
    }

    /// Run `read` under the shared latch against `op`, or against committed
    /// pages when `op` is `None`.
    fn read_with<T>(
        &self,
        op: Option<&AtomicOperation<'_>>,
        read: impl FnOnce(&dyn PageSource, &TreeState) -> Result<T, IndexError>,
    ) -> Result<T, IndexError> {
        let _latch = self.manager.acquire_read_lock(&self.name);
        let state = self.read_state();
        let state = Self::opened(&self.name, state.as_ref())?;
        match op {
            Some(op) => read(op, state),
            None => read(&*self.manager, state),
        }
    }

    fn lookup(
        &self,
        source: &dyn PageSource,
        state: &TreeState,
        key: Option<&Key>,
    ) -> Result<Option<RecordLocator>, IndexError> {
        let Some(key) = key else {
            return self.null_value(source, state);
        };
        let key = self.preprocess(state, key.clone());
        let search = self.find_leaf(source, state, &key)?;
        match search.found {
            Ok(index) => Ok(Some(search.bucket.value(index, &self.codec).context(&self.name)?)),
            Err(_) => Ok(None),
        }
    }

    fn tree_size(&self, source: &dyn PageSource, state: &TreeState) -> Result<u64, IndexError> {
        let entry_point = EntryPoint::new(
            source
                .load_for_read(state.file_id, ENTRY_POINT_INDEX)
                .context(&self.name)?,
        );
        Ok(u64::try_from(entry_point.tree_size()).unwrap_or(0))
    }

    fn key_at(
        &self,
        source: &dyn PageSource,
        state: &TreeState,
        item: Option<(PageIndex, usize)>,
    ) -> Result<Option<Key>, IndexError> {
        let Some((page, index)) = item else {
            return Ok(None);
        };
        let bucket = Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?);
        Ok(Some(bucket.key(index, &self.codec).context(&self.name)?))
    }

    const fn lower_mode(inclusive: bool) -> PartialSearchMode {
        if inclusive {
            PartialSearchMode::LowestBoundary
        } else {
            PartialSearchMode::HighestBoundary
        }
    }

    const fn upper_mode(inclusive: bool) -> PartialSearchMode {
        if inclusive {
            PartialSearchMode::HighestBoundary
        } else {
            PartialSearchMode::LowestBoundary
        }
    }

    fn bound(key: Key, inclusive: bool) -> Bound<Key> {
        if inclusive {
            Bound::Included(key)
        } else {
            Bound::Excluded(key)
        }
    }

    fn preprocess(&self, state: &TreeState, key: Key) -> Key {
        self.codec.preprocess(key, state.key_types.as_deref())
    }

    fn boundary(&self, state: &TreeState, key: &Key, mode: PartialSearchMode) -> Key {
        self.preprocess(state, key.clone()).pad(state.key_arity, mode)
    }

    fn update(
        &self,
        op: &AtomicOperation<'_>,
        key: Option<Key>,
        value: RecordLocator,
        validator: Option<&dyn Validator>,
    ) -> Result<bool, IndexError> {
        self.manager
            .acquire_exclusive_lock_till_operation_complete(op, &self.name)
            .context(&self.name)?;
        let state = self.read_state();
        let state = Self::opened(&self.name, state.as_ref())?;

        let Some(key) = key else {
            return self.update_null(op, state, value, validator);
        };
        let key = self.preprocess(state, key);
        let raw_key = self.codec.serialize(&key).context(&self.name)?;
        if raw_key.len() > self.config.max_key_size {
            return Err(IndexError::KeyTooLarge {
                component: self.name.clone(),
                size: raw_key.len(),
                max: self.config.max_key_size,
            });
        }

        let (path, found) = self.find_path(op, state, &key)?;
        let Some(leaf) = path.last().copied() else {
            return Err(self.corrupted("empty descent path".to_string()));
        };

        let mut bucket =
            Bucket::new(op.load_for_write(state.file_id, leaf.page).context(&self.name)?);
        let previous = match found {
            Ok(index) => Some(bucket.value(index, &self.codec).context(&self.name)?),
            Err(_) => None,
        };
        let value = match validator {
            Some(validator) => match self.validate(validator, Some(&key), previous, value)? {
                Validation::Accept(value) => value,
                Validation::Ignore => return Ok(false),
            },
            None => value,
        };
        let raw_value = value.to_bytes();

        let size_diff = if let Ok(index) = found {
            let stored_key = bucket.raw_key(index, &self.codec).context(&self.name)?;
            let stored_len = bucket.raw_value(index, &self.codec).context(&self.name)?.len();
            if stored_len == raw_value.len() {
                bucket
                    .update_value(index, &raw_value, stored_key.len())
                    .context(&self.name)?;
                return Ok(true);
            }
            bucket.remove_leaf_entry(index, &stored_key).context(&self.name)?;
            0
        } else {
            1
        };
        drop(bucket);

        self.insert(
            op,
            state,
            path,
            PendingEntry::Leaf {
                key: raw_key,
                value: raw_value,
            },
        )?;
        if size_diff != 0 {
            self.update_size(op, state, size_diff)?;
        }
        Ok(true)
    }

    fn update_null(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
        value: RecordLocator,
        validator: Option<&dyn Validator>,
    ) -> Result<bool, IndexError> {
        let page = if op.filled_up_to(state.null_file_id).context(&self.name)? == 0 {
            let mut page = op.add_page(state.null_file_id).context(&self.name)?;
            NullBucket::new(&mut *page).init();
            page
        } else {
            op.load_for_write(state.null_file_id, NULL_BUCKET_INDEX)
                .context(&self.name)?
        };
        let mut bucket = NullBucket::new(page);
        let previous = bucket.value();

        let value = match validator {
            Some(validator) => match self.validate(validator, None, previous, value)? {
                Validation::Accept(value) => value,
                Validation::Ignore => return Ok(false),
            },
            None => value,
        };
        bucket.set_value(value);
        drop(bucket);

        if previous.is_none() {
            self.update_size(op, state, 1)?;
        }
        Ok(true)
    }

    fn remove_null(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
    ) -> Result<Option<RecordLocator>, IndexError> {
        if op.filled_up_to(state.null_file_id).context(&self.name)? == 0 {
            return Ok(None);
        }
        let mut bucket = NullBucket::new(
            op.load_for_write(state.null_file_id, NULL_BUCKET_INDEX)
                .context(&self.name)?,
        );
        let removed = bucket.value();
        if removed.is_some() {
            bucket.remove_value();
        }
        drop(bucket);

        if removed.is_some() {
            self.update_size(op, state, -1)?;
        }
        Ok(removed)
    }

    fn null_value<S: PageSource + ?Sized>(
        &self,
        source: &S,
        state: &TreeState,
    ) -> Result<Option<RecordLocator>, IndexError> {
        if source.filled_up_to(state.null_file_id).context(&self.name)? == 0 {
            return Ok(None);
        }
        let bucket = NullBucket::new(
            source
                .load_for_read(state.null_file_id, NULL_BUCKET_INDEX)
                .context(&self.name)?,
        );
        Ok(bucket.value())
    }

    fn validate(
        &self,
        validator: &dyn Validator,
        key: Option<&Key>,
        previous: Option<RecordLocator>,
        value: RecordLocator,
    ) -> Result<Validation, IndexError> {
        validator
            .validate(key, previous, value)
            .map_err(|source| IndexError::Validation {
                component: self.name.clone(),
                source,
            })
    }

    fn update_size(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
        diff: i64,
    ) -> Result<(), IndexError> {
        let mut entry_point = EntryPoint::new(
            op.load_for_write(state.file_id, ENTRY_POINT_INDEX)
                .context(&self.name)?,
        );
        let size = entry_point.tree_size();
        entry_point.set_tree_size(size + diff);
        Ok(())
    }

    /// Hand out a bucket page: the next page past the allocation mark if
    /// the file already has it, otherwise a new page at the end of the file.
    fn allocate_page<'o>(
        &self,
        op: &'o AtomicOperation<'_>,
        state: &TreeState,
    ) -> Result<WriteEntry<'o>, IndexError> {
        let mut entry_point = EntryPoint::new(
            op.load_for_write(state.file_id, ENTRY_POINT_INDEX)
                .context(&self.name)?,
        );
        let next = entry_point.pages_size() + 1;
        let page = if next < op.filled_up_to(state.file_id).context(&self.name)? {
            op.load_for_write(state.file_id, next).context(&self.name)?
        } else {
            op.add_page(state.file_id).context(&self.name)?
        };
        entry_point.set_pages_size(page.page_index());
        Ok(page)
    }

    /// Descend from the root to the leaf that holds or would hold `key`.
    fn find_leaf<'s, S: PageSource + ?Sized>(
        &self,
        source: &'s S,
        state: &TreeState,
        key: &Key,
    ) -> Result<LeafSearch<'s>, IndexError> {
        let mut page = ROOT_INDEX;
        for _ in 0..self.config.max_depth {
            let bucket =
                Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?);
            let found = bucket.find(key, &self.codec).context(&self.name)?;
            if bucket.is_leaf() {
                return Ok(LeafSearch {
                    page,
                    bucket,
                    found,
                });
            }
            page = self.descend(&bucket, page, found)?;
        }
        Err(self.depth_exceeded())
    }

    /// Like [`Self::find_leaf`], but records the insertion slot at every
    /// level so a split can walk back up.
    fn find_path(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
        key: &Key,
    ) -> Result<(Vec<PathItem>, Result<usize, usize>), IndexError> {
        let mut path = Vec::new();
        let mut page = ROOT_INDEX;
        for _ in 0..self.config.max_depth {
            let bucket = Bucket::new(op.load_for_read(state.file_id, page).context(&self.name)?);
            let found = bucket.find(key, &self.codec).context(&self.name)?;
            if bucket.is_leaf() {
                let slot = match found {
                    Ok(index) | Err(index) => index,
                };
                path.push(PathItem { page, slot });
                return Ok((path, found));
            }
            let slot = match found {
                Ok(index) => index + 1,
                Err(index) => index,
            };
            path.push(PathItem { page, slot });
            page = self.descend(&bucket, page, found)?;
        }
        Err(self.depth_exceeded())
    }

    /// Child of an internal bucket to follow for a search result. Keys equal
    /// to a separator live in its right subtree.
    fn descend(
        &self,
        bucket: &Bucket<ReadEntry<'_>>,
        page: PageIndex,
        found: Result<usize, usize>,
    ) -> Result<PageIndex, IndexError> {
        if bucket.is_empty() {
            return Err(self.corrupted(format!("internal bucket {page} is empty")));
        }
        let child = match found {
            Ok(index) => bucket.right_child(index),
            Err(index) if index >= bucket.size() => bucket.right_child(index - 1),
            Err(index) => bucket.left_child(index),
        };
        child.context(&self.name)
    }

    /// Page of child `child` of an internal bucket with `size` entries,
    /// counting children left to right from 0 to `size`.
    fn child_page(
        &self,
        bucket: &Bucket<ReadEntry<'_>>,
        child: usize,
    ) -> Result<PageIndex, IndexError> {
        if child < bucket.size() {
            bucket.left_child(child).context(&self.name)
        } else {
            bucket.right_child(child - 1).context(&self.name)
        }
    }

    /// Leftmost entry, stepping back over empty leaves.
    fn first_item<S: PageSource + ?Sized>(
        &self,
        source: &S,
        state: &TreeState,
    ) -> Result<Option<(PageIndex, usize)>, IndexError> {
        let mut path: Vec<(PageIndex, usize)> = Vec::new();
        let mut page = ROOT_INDEX;
        let mut child = 0;
        loop {
            if path.len() >= self.config.max_depth {
                return Err(self.depth_exceeded());
            }
            let bucket =
                Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?);

            let exhausted = if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some((page, 0)));
                }
                true
            } else {
                bucket.is_empty() || child > bucket.size()
            };

            if exhausted {
                let Some((parent, parent_child)) = path.pop() else {
                    return Ok(None);
                };
                page = parent;
                child = parent_child + 1;
            } else {
                path.push((page, child));
                page = self.child_page(&bucket, child)?;
                child = 0;
            }
        }
    }

    /// Rightmost entry, stepping back over empty leaves.
    fn last_item<S: PageSource + ?Sized>(
        &self,
        source: &S,
        state: &TreeState,
    ) -> Result<Option<(PageIndex, usize)>, IndexError> {
        let mut path: Vec<(PageIndex, usize)> = Vec::new();
        let mut page = ROOT_INDEX;
        // `None` starts at the rightmost child.
        let mut child: Option<usize> = None;
        loop {
            if path.len() >= self.config.max_depth {
                return Err(self.depth_exceeded());
            }
            let bucket =
                Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?);

            let next = if bucket.is_leaf() {
                if let Some(last) = bucket.size().checked_sub(1) {
                    return Ok(Some((page, last)));
                }
                None
            } else if bucket.is_empty() {
                None
            } else {
                Some(child.unwrap_or_else(|| bucket.size()).min(bucket.size()))
            };

            if let Some(next) = next {
                path.push((page, next));
                page = self.child_page(&bucket, next)?;
                child = None;
                continue;
            }

            loop {
                let Some((parent, parent_child)) = path.pop() else {
                    return Ok(None);
                };
                if let Some(previous) = parent_child.checked_sub(1) {
                    page = parent;
                    child = Some(previous);
                    break;
                }
            }
        }
    }

    /// Collect up to `limit` entries in ascending key order starting at
    /// `from`, stopping past `to`. Reads through `op` when given.
    ///
    /// Returns whether entries may remain past the last one collected.
    pub(super) fn fetch_ascending(
        &self,
        op: Option<&AtomicOperation<'_>>,
        from: Bound<&Key>,
        to: Bound<&Key>,
        limit: usize,
        out: &mut VecDeque<(Key, RecordLocator)>,
    ) -> Result<bool, IndexError> {
        self.read_with(op, |source, state| {
            self.scan_ascending(source, state, (from, to), limit, out)
        })
    }

    fn scan_ascending(
        &self,
        source: &dyn PageSource,
        state: &TreeState,
        (from, to): (Bound<&Key>, Bound<&Key>),
        limit: usize,
        out: &mut VecDeque<(Key, RecordLocator)>,
    ) -> Result<bool, IndexError> {
        let (mut bucket, mut index) = match from {
            Bound::Included(key) | Bound::Excluded(key) => {
                let search = self.find_leaf(source, state, key)?;
                let index = match search.found {
                    Ok(index) if matches!(from, Bound::Excluded(_)) => index + 1,
                    Ok(index) | Err(index) => index,
                };
                (search.bucket, index)
            }
            Bound::Unbounded => match self.first_item(source, state)? {
                Some((page, index)) => (
                    Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?),
                    index,
                ),
                None => return Ok(false),
            },
        };

        let max_hops = source.filled_up_to(state.file_id).context(&self.name)?;
        let mut hops = 0;
        let mut collected = 0;
        loop {
            if index >= bucket.size() {
                let Some(next) = bucket.right_sibling() else {
                    return Ok(false);
                };
                hops += 1;
                if hops > max_hops {
                    return Err(self.corrupted("leaf sibling chain does not end".to_string()));
                }
                bucket =
                    Bucket::new(source.load_for_read(state.file_id, next).context(&self.name)?);
                index = 0;
                continue;
            }

            let key = bucket.key(index, &self.codec).context(&self.name)?;
            let past_end = match to {
                Bound::Included(to) => self.codec.compare(&key, to).is_gt(),
                Bound::Excluded(to) => self.codec.compare(&key, to).is_ge(),
                Bound::Unbounded => false,
            };
            if past_end {
                return Ok(false);
            }
            let value = bucket.value(index, &self.codec).context(&self.name)?;
            out.push_back((key, value));
            collected += 1;
            index += 1;

            if collected >= limit {
                return Ok(true);
            }
        }
    }

    /// Collect up to `limit` entries in descending key order starting at
    /// `to`, stopping before `from`.
    pub(super) fn fetch_descending(
        &self,
        op: Option<&AtomicOperation<'_>>,
        from: Bound<&Key>,
        to: Bound<&Key>,
        limit: usize,
        out: &mut VecDeque<(Key, RecordLocator)>,
    ) -> Result<bool, IndexError> {
        self.read_with(op, |source, state| {
            self.scan_descending(source, state, (from, to), limit, out)
        })
    }

    fn scan_descending(
        &self,
        source: &dyn PageSource,
        state: &TreeState,
        (from, to): (Bound<&Key>, Bound<&Key>),
        limit: usize,
        out: &mut VecDeque<(Key, RecordLocator)>,
    ) -> Result<bool, IndexError> {
        let (mut bucket, mut index) = match to {
            Bound::Included(key) | Bound::Excluded(key) => {
                let search = self.find_leaf(source, state, key)?;
                let index = match search.found {
                    Ok(index) if matches!(to, Bound::Included(_)) => Some(index),
                    Ok(index) | Err(index) => index.checked_sub(1),
                };
                (search.bucket, index)
            }
            Bound::Unbounded => match self.last_item(source, state)? {
                Some((page, index)) => (
                    Bucket::new(source.load_for_read(state.file_id, page).context(&self.name)?),
                    Some(index),
                ),
                None => return Ok(false),
            },
        };

        let max_hops = source.filled_up_to(state.file_id).context(&self.name)?;
        let mut hops = 0;
        let mut collected = 0;
        loop {
            let Some(current) = index else {
                let Some(previous) = bucket.left_sibling() else {
                    return Ok(false);
                };
                hops += 1;
                if hops > max_hops {
                    return Err(self.corrupted("leaf sibling chain does not end".to_string()));
                }
                bucket = Bucket::new(
                    source
                        .load_for_read(state.file_id, previous)
                        .context(&self.name)?,
                );
                index = bucket.size().checked_sub(1);
                continue;
            };

            let key = bucket.key(current, &self.codec).context(&self.name)?;
            let past_end = match from {
                Bound::Included(from) => self.codec.compare(&key, from).is_lt(),
                Bound::Excluded(from) => self.codec.compare(&key, from).is_le(),
                Bound::Unbounded => false,
            };
            if past_end {
                return Ok(false);
            }
            let value = bucket.value(current, &self.codec).context(&self.name)?;
            out.push_back((key, value));
            collected += 1;
            index = current.checked_sub(1);

            if collected >= limit {
                return Ok(true);
            }
        }
    }

    fn depth_exceeded(&self) -> IndexError {
        self.corrupted(format!(
            "descent exceeded the maximum depth of {}",
            self.config.max_depth
        ))
    }

    fn corrupted(&self, message: String) -> IndexError {
        corrupted(&self.name, message)
    }

    fn opened<'g>(name: &str, state: Option<&'g TreeState>) -> Result<&'g TreeState, IndexError> {
        state.ok_or_else(|| IndexError::NotOpen {
            component: name.to_string(),
        })
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn read_state(&self) -> RwLockReadGuard<'_, Option<TreeState>> {
        self.state.read().expect("tree state lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn write_state(&self) -> RwLockWriteGuard<'_, Option<TreeState>> {
        self.state.write().expect("tree state lock poisoned")
    }
}

impl<C: KeyCodec> SingleValueTree<C> {
    /// Insert `entry` at the bottom of `path`, splitting full buckets on the
    /// way up.
    fn insert(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
        mut path: Vec<PathItem>,
        entry: PendingEntry,
    ) -> Result<(), IndexError> {
        let Some(leaf_depth) = path.len().checked_sub(1) else {
            return Err(self.corrupted("empty descent path".to_string()));
        };
        let mut pending = vec![(leaf_depth, entry)];

        while let Some((depth, entry)) = pending.pop() {
            let PathItem { page, slot } = path[depth];
            let mut bucket =
                Bucket::new(op.load_for_write(state.file_id, page).context(&self.name)?);

            let added = match &entry {
                PendingEntry::Leaf { key, value } => bucket.add_leaf_entry(slot, key, value),
                PendingEntry::Separator {
                    left, right, key, ..
                } => bucket.add_non_leaf_entry(slot, *left, *right, key, true),
            }
            .context(&self.name)?;

            if added {
                if let PendingEntry::Separator {
                    went_right: true, ..
                } = entry
                {
                    path[depth].slot += 1;
                }
                continue;
            }

            let split = self.split(op, state, bucket, page, slot)?;
            if depth == 0 {
                // The root became an internal bucket over two new children.
                path[0] = PathItem {
                    page: ROOT_INDEX,
                    slot: usize::from(split.went_right),
                };
                path.insert(1, split.target);
                for (pending_depth, _) in &mut pending {
                    *pending_depth += 1;
                }
                pending.push((1, entry));
            } else {
                path[depth] = split.target;
                pending.push((depth, entry));
                pending.push((
                    depth - 1,
                    PendingEntry::Separator {
                        left: page,
                        right: split.right,
                        key: split.separator,
                        went_right: split.went_right,
                    },
                ));
            }
        }
        Ok(())
    }

    /// Split the full bucket `page` at its median. `slot` is where the entry
    /// that did not fit was headed.
    fn split(
        &self,
        op: &AtomicOperation<'_>,
        state: &TreeState,
        mut bucket: Bucket<WriteEntry<'_>>,
        page: PageIndex,
        slot: usize,
    ) -> Result<Split, IndexError> {
        let size = bucket.size();
        let is_leaf = bucket.is_leaf();
        let median = size >> 1;
        // Internal separators move up and stay in neither half.
        let right_start = if is_leaf { median } else { median + 1 };
        if median == 0 || right_start >= size {
            return Err(self.corrupted(format!(
                "bucket {page} is full with only {size} entries"
            )));
        }

        let separator = bucket.raw_key(median, &self.codec).context(&self.name)?;
        let right_entries = (right_start..size)
            .map(|i| bucket.raw_entry(i, &self.codec))
            .collect::<Result<Vec<_>, _>>()
            .context(&self.name)?;

        let went_right = slot > median;
        let right_slot = slot.saturating_sub(right_start);

        if page == ROOT_INDEX {
            let left_entries = (0..median)
                .map(|i| bucket.raw_entry(i, &self.codec))
                .collect::<Result<Vec<_>, _>>()
                .context(&self.name)?;

            let left_page = self.allocate_page(op, state)?;
            let right_page = self.allocate_page(op, state)?;
            let (left_index, right_index) = (left_page.page_index(), right_page.page_index());
            {
                let mut left = Bucket::new(left_page);
                let mut right = Bucket::new(right_page);
                left.init(is_leaf);
                left.add_all(&left_entries);
                right.init(is_leaf);
                right.add_all(&right_entries);
                if is_leaf {
                    left.set_right_sibling(Some(right_index));
                    right.set_left_sibling(Some(left_index));
                }
            }

            bucket.shrink(0, &self.codec).context(&self.name)?;
            if is_leaf {
                bucket.switch_bucket_type().context(&self.name)?;
            }
            let added = bucket
                .add_non_leaf_entry(0, left_index, right_index, &separator, true)
                .context(&self.name)?;
            if !added {
                return Err(self.corrupted("separator does not fit an empty root".to_string()));
            }

            tracing::debug!(
                component = %self.name,
                left = left_index,
                right = right_index,
                leaf = is_leaf,
                "root split"
            );
            let target = if went_right {
                PathItem {
                    page: right_index,
                    slot: right_slot,
                }
            } else {
                PathItem {
                    page: left_index,
                    slot,
                }
            };
            return Ok(Split {
                target,
                right: right_index,
                separator,
                went_right,
            });
        }

        let right_page = self.allocate_page(op, state)?;
        let right_index = right_page.page_index();
        let mut right = Bucket::new(right_page);
        right.init(is_leaf);
        right.add_all(&right_entries);

        if is_leaf {
            let old_right = bucket.right_sibling();
            right.set_left_sibling(Some(page));
            right.set_right_sibling(old_right);
            bucket.set_right_sibling(Some(right_index));
            if let Some(old_right) = old_right {
                let mut neighbor = Bucket::new(
                    op.load_for_write(state.file_id, old_right)
                        .context(&self.name)?,
                );
                neighbor.set_left_sibling(Some(right_index));
            }
        }
        bucket.shrink(median, &self.codec).context(&self.name)?;

        tracing::debug!(
            component = %self.name,
            page,
            new_page = right_index,
            leaf = is_leaf,
            "bucket split"
        );
        let target = if went_right {
            PathItem {
                page: right_index,
                slot: right_slot,
            }
        } else {
            PathItem { page, slot }
        };
        Ok(Split {
            target,
            right: right_index,
            separator,
            went_right,
        })
    }
}

/// Outcome of splitting one bucket.
struct Split {
    /// Where the entry that did not fit goes now.
    target: PathItem,
    /// The new right page.
    right: PageIndex,
    /// Key to insert into the parent.
    separator: Vec<u8>,
    went_right: bool,
}

fn corrupted(component: &str, message: String) -> IndexError {
    tracing::warn!(component, %message, "index corruption detected");
    IndexError::Corrupted {
        component: component.to_string(),
        message,
    }
}

/// Attach the component name to lower-layer errors.
trait Context<T> {
    fn context(self, component: &str) -> Result<T, IndexError>;
}

impl<T> Context<T> for Result<T, StorageError> {
    fn context(self, component: &str) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::Storage {
            component: component.to_string(),
            source,
        })
    }
}

impl<T> Context<T> for Result<T, BucketError> {
    fn context(self, component: &str) -> Result<T, IndexError> {
        self.map_err(|e| corrupted(component, e.to_string()))
    }
}

impl<T> Context<T> for Result<T, KeyCodecError> {
    fn context(self, component: &str) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::InvalidKey {
            component: component.to_string(),
            source,
        })
    }
}

/// Errors that can occur during index operations. Every variant names the
/// component it came from.
#[derive(Debug)]
pub enum IndexError {
    /// The page store or the journal failed.
    Storage {
        component: String,
        source: StorageError,
    },
    /// The stored tree does not hold what it should; it must be rebuilt.
    Corrupted { component: String, message: String },
    /// The encoded key is larger than the configured maximum.
    KeyTooLarge {
        component: String,
        size: usize,
        max: usize,
    },
    /// A caller-supplied key cannot be encoded.
    InvalidKey {
        component: String,
        source: KeyCodecError,
    },
    /// The validator of a `validated_put` failed.
    Validation {
        component: String,
        source: ValidationError,
    },
    /// The tree has not been created or loaded.
    NotOpen { component: String },
    /// The tree was handed an invalid configuration.
    Config {
        component: String,
        source: ConfigError,
    },
}

impl IndexError {
    /// Name of the component that raised the error.
    #[must_use]
    pub fn component(&self) -> &str {
        match self {
            Self::Storage { component, .. }
            | Self::Corrupted { component, .. }
            | Self::KeyTooLarge { component, .. }
            | Self::InvalidKey { component, .. }
            | Self::Validation { component, .. }
            | Self::NotOpen { component }
            | Self::Config { component, .. } => component,
        }
    }

    /// True when the index must be rebuilt.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage { component, source } => write!(f, "{component}: storage error: {source}"),
            Self::Corrupted { component, message } => {
                write!(f, "{component}: index is corrupted and must be rebuilt: {message}")
            }
            Self::KeyTooLarge {
                component,
                size,
                max,
            } => write!(
                f,
                "{component}: key of {size} bytes exceeds the maximum of {max}"
            ),
            Self::InvalidKey { component, source } => write!(f, "{component}: invalid key: {source}"),
            Self::Validation { component, source } => {
                write!(f, "{component}: value rejected by validator: {source}")
            }
            Self::NotOpen { component } => write!(f, "{component}: index is not open"),
            Self::Config { component, source } => {
                write!(f, "{component}: invalid configuration: {source}")
            }
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage { source, .. } => Some(source),
            Self::InvalidKey { source, .. } => Some(source),
            Self::Validation { source, .. } => Some(&**source),
            Self::Config { source, .. } => Some(source),
            Self::Corrupted { .. } | Self::KeyTooLarge { .. } | Self::NotOpen { .. } => None,
        }
    }
}

/// Used by [`AtomicOperationsManager::calculate_in_operation`] when the
/// commit itself fails.
impl From<StorageError> for IndexError {
    fn from(source: StorageError) -> Self {
        Self::Storage {
            component: "atomic operation".to_string(),
            source,
        }
    }
}
