//! Atomic operations over a page store.
//!
//! An [`AtomicOperation`] collects page images in a private write set. Nothing
//! reaches the page store until [`AtomicOperationsManager::commit`], which
//! journals every image (when a journal is configured) before applying them,
//! so all writes of one operation become durable together or not at all.
//!
//! Page access goes through scoped handles:
//! - [`ReadEntry`] holds a copy of a page for reading
//! - [`WriteEntry`] holds a page for writing and returns it to the owning
//!   operation's write set when dropped
//!
//! Both handles count as pins on the manager until dropped, which makes
//! leaked handles observable through [`AtomicOperationsManager::pinned_pages`].
//!
//! A journaled manager checkpoints after the thresholds configured through
//! [`AtomicOperationsManager::with_config`]: it syncs the page store and
//! truncates the journal, so the journal never holds more than one
//! checkpoint interval of page images.
//!
//! # Component latches
//!
//! Components (index trees) can take a latch that is held until the current
//! operation completes. Readers acquire the same latch in shared mode through
//! [`AtomicOperationsManager::acquire_read_lock`]. The thread that took the
//! exclusive latch passes its own shared acquisitions straight through; it
//! reads the committed state like everyone else.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

use crate::config::IndexConfig;
use crate::storage::checkpoint::{CheckpointConfig, CheckpointState};
use crate::storage::file::FilePageStore;
use crate::storage::io::{FileId, PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::recovery::{RecoveryResult, recover};
use crate::storage::wal::{LogFile, LogRecordPayload, Wal};

/// Name of the journal file created by [`AtomicOperationsManager::open_directory`].
pub const JOURNAL_FILE_NAME: &str = "journal.wal";

type Journal = Wal<Box<dyn LogFile + Send>>;

/// Anything pages can be read from: the committed store or an operation's view.
pub trait PageSource {
    /// Load a page for reading.
    fn load_for_read(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<ReadEntry<'_>, StorageError>;

    /// Number of pages in the file as seen by this source.
    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError>;
}

/// A page loaded for reading. Releases its pin when dropped.
pub struct ReadEntry<'a> {
    page: Page,
    pins: &'a AtomicUsize,
}

impl<'a> ReadEntry<'a> {
    fn new(page: Page, pins: &'a AtomicUsize) -> Self {
        pins.fetch_add(1, Ordering::SeqCst);
        Self { page, pins }
    }
}

impl Deref for ReadEntry<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for ReadEntry<'_> {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A page loaded for writing inside an atomic operation.
///
/// Mutable access marks the page dirty; a dirty page is put back into the
/// operation's write set when the handle is dropped.
pub struct WriteEntry<'a> {
    key: (FileId, PageIndex),
    page: Option<Page>,
    dirty: bool,
    state: &'a RefCell<OperationState>,
    pins: &'a AtomicUsize,
}

impl WriteEntry<'_> {
    /// Index of the page inside its file.
    #[must_use]
    pub const fn page_index(&self) -> PageIndex {
        self.key.1
    }
}

impl Deref for WriteEntry<'_> {
    type Target = Page;

    #[allow(clippy::expect_used)] // page is only taken in drop
    fn deref(&self) -> &Page {
        self.page.as_ref().expect("write entry used after release")
    }
}

impl DerefMut for WriteEntry<'_> {
    #[allow(clippy::expect_used)] // page is only taken in drop
    fn deref_mut(&mut self) -> &mut Page {
        self.dirty = true;
        self.page.as_mut().expect("write entry used after release")
    }
}

impl Drop for WriteEntry<'_> {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.pinned.remove(&self.key);
        if let Some(page) = self.page.take() {
            if self.dirty || state.taken.remove(&self.key) {
                state.pages.insert(self.key, page);
            }
        }
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Private state of one atomic operation.
#[derive(Default)]
struct OperationState {
    /// Page images written by this operation, in commit order.
    pages: BTreeMap<(FileId, PageIndex), Page>,
    /// Pages currently held by a live `WriteEntry`.
    pinned: HashSet<(FileId, PageIndex)>,
    /// Pinned pages whose image was moved out of `pages` while held.
    taken: HashSet<(FileId, PageIndex)>,
    /// File sizes including pages added by this operation.
    filled_up_to: HashMap<FileId, u64>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    latches: Vec<String>,
}

/// One unit of page mutations that commits or rolls back as a whole.
///
/// Dropping an operation without committing rolls it back.
pub struct AtomicOperation<'m> {
    id: u64,
    manager: &'m AtomicOperationsManager,
    state: RefCell<OperationState>,
    finished: Cell<bool>,
}

impl AtomicOperation<'_> {
    /// Identifier of this operation, unique within the manager.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Load a page for writing.
    ///
    /// # Errors
    ///
    /// Fails if the page is out of bounds or already held for write by this
    /// operation.
    pub fn load_for_write(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<WriteEntry<'_>, StorageError> {
        let key = (file_id, page_index);
        let filled_up_to = self.filled_up_to(file_id)?;
        if page_index >= filled_up_to {
            return Err(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to,
            });
        }

        let mut state = self.state.borrow_mut();
        if state.pinned.contains(&key) {
            return Err(StorageError::PageAlreadyPinned {
                file_id,
                page_index,
            });
        }
        let page = if let Some(page) = state.pages.remove(&key) {
            state.taken.insert(key);
            page
        } else {
            self.manager.store.read_page(file_id, page_index)?
        };
        state.pinned.insert(key);
        drop(state);

        self.manager.pins.fetch_add(1, Ordering::SeqCst);
        Ok(WriteEntry {
            key,
            page: Some(page),
            dirty: false,
            state: &self.state,
            pins: &self.manager.pins,
        })
    }

    /// Append a zeroed page to the file and load it for writing.
    pub fn add_page(&self, file_id: FileId) -> Result<WriteEntry<'_>, StorageError> {
        let page_index = self.filled_up_to(file_id)?;
        let key = (file_id, page_index);

        let mut state = self.state.borrow_mut();
        state.filled_up_to.insert(file_id, page_index + 1);
        state.pinned.insert(key);
        drop(state);

        self.manager.pins.fetch_add(1, Ordering::SeqCst);
        Ok(WriteEntry {
            key,
            page: Some(Page::new()),
            dirty: true,
            state: &self.state,
            pins: &self.manager.pins,
        })
    }

    /// Create a file. Rolling the operation back deletes it again.
    pub fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let file_id = self.manager.store.add_file(name)?;
        self.state.borrow_mut().created_files.push(file_id);
        Ok(file_id)
    }

    /// Open an existing file.
    pub fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        self.manager.store.open_file(name)
    }

    /// Delete a file when the operation commits.
    pub fn delete_file(&self, file_id: FileId) -> Result<(), StorageError> {
        // Validates the id now so a bad id fails the operation, not the commit.
        self.manager.store.file_name(file_id)?;
        self.state.borrow_mut().deleted_files.push(file_id);
        Ok(())
    }

    /// Number of dirty pages in the write set.
    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.state.borrow().pages.len()
    }

    fn take_state(&self) -> OperationState {
        self.finished.set(true);
        std::mem::take(&mut *self.state.borrow_mut())
    }
}

impl PageSource for AtomicOperation<'_> {
    fn load_for_read(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<ReadEntry<'_>, StorageError> {
        let key = (file_id, page_index);
        let state = self.state.borrow();
        if state.pinned.contains(&key) {
            return Err(StorageError::PageAlreadyPinned {
                file_id,
                page_index,
            });
        }
        let page = match state.pages.get(&key) {
            Some(page) => page.clone(),
            None => self.manager.store.read_page(file_id, page_index)?,
        };
        Ok(ReadEntry::new(page, &self.manager.pins))
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError> {
        if let Some(&filled) = self.state.borrow().filled_up_to.get(&file_id) {
            return Ok(filled);
        }
        self.manager.store.filled_up_to(file_id)
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            let state = self.take_state();
            self.manager.discard(self.id, state);
        }
    }
}

#[derive(Debug, Default)]
struct ComponentLatch {
    /// Operation holding the latch exclusively, and the thread that took it.
    owner: Option<(u64, ThreadId)>,
    readers: usize,
}

/// Shared latch on a component, released when dropped.
pub struct ComponentReadGuard<'a> {
    manager: &'a AtomicOperationsManager,
    component: String,
}

impl Drop for ComponentReadGuard<'_> {
    fn drop(&mut self) {
        let mut latches = self.manager.lock_latches();
        if let Some(latch) = latches.get_mut(&self.component) {
            latch.readers = latch.readers.saturating_sub(1);
        }
        drop(latches);
        self.manager.latch_released.notify_all();
    }
}

/// Starts, commits, and rolls back atomic operations over one page store.
pub struct AtomicOperationsManager {
    store: Arc<dyn PageStore>,
    /// Journal, also serializing commits so journal order is apply order.
    journal: Mutex<Option<Journal>>,
    next_operation_id: AtomicU64,
    pins: AtomicUsize,
    latches: Mutex<HashMap<String, ComponentLatch>>,
    latch_released: Condvar,
    /// Locked only while holding `journal`.
    checkpoints: Mutex<CheckpointState>,
    sync_on_commit: bool,
}

impl AtomicOperationsManager {
    /// Create a manager without a journal. Commits are atomic with respect to
    /// readers but not crash-safe.
    #[must_use]
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            journal: Mutex::new(None),
            next_operation_id: AtomicU64::new(1),
            pins: AtomicUsize::new(0),
            latches: Mutex::new(HashMap::new()),
            latch_released: Condvar::new(),
            checkpoints: Mutex::new(CheckpointState::default()),
            sync_on_commit: true,
        }
    }

    /// Create a manager journaling into `journal`, replaying any committed
    /// operations found in it first.
    pub fn with_journal<F: LogFile + Send + 'static>(
        store: Arc<dyn PageStore>,
        journal: F,
    ) -> Result<(Self, RecoveryResult), StorageError> {
        let boxed: Box<dyn LogFile + Send> = Box::new(journal);
        let mut wal = Wal::open(boxed)?;
        let recovered = recover(store.as_ref(), &mut wal)?;

        let manager = Self::new(store);
        *manager.lock_journal() = Some(wal);
        Ok((manager, recovered))
    }

    /// Open a file-backed store with a journal inside `directory`.
    pub fn open_directory(directory: &Path) -> Result<(Self, RecoveryResult), StorageError> {
        let store = FilePageStore::open(directory)?;
        let journal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(JOURNAL_FILE_NAME))?;
        Self::with_journal(Arc::new(store), journal)
    }

    /// Apply the durability settings of `config`: whether commits sync the
    /// page store, and when the journal is checkpointed.
    #[must_use]
    pub fn with_config(mut self, config: &IndexConfig) -> Self {
        self.sync_on_commit = config.sync_on_commit;
        self.lock_checkpoints().set_config(CheckpointConfig::new(
            config.checkpoint_operations,
            config.checkpoint_bytes,
        ));
        self
    }

    /// The underlying page store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Number of page handles currently alive.
    #[must_use]
    pub fn pinned_pages(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Begin a new atomic operation.
    #[must_use]
    pub fn start_atomic_operation(&self) -> AtomicOperation<'_> {
        let id = self.next_operation_id.fetch_add(1, Ordering::SeqCst);
        AtomicOperation {
            id,
            manager: self,
            state: RefCell::new(OperationState::default()),
            finished: Cell::new(false),
        }
    }

    /// Run `f` inside a fresh operation: commit on `Ok`, roll back on `Err`.
    pub fn calculate_in_operation<T, E>(
        &self,
        f: impl FnOnce(&AtomicOperation<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let operation = self.start_atomic_operation();
        match f(&operation) {
            Ok(value) => {
                self.commit(operation)?;
                Ok(value)
            }
            Err(e) => {
                self.rollback(operation);
                Err(e)
            }
        }
    }

    /// Make every page written by `operation` durable.
    ///
    /// With a journal, images are journaled and synced before the store sees
    /// them; a failure before the COMMIT record leaves the store untouched.
    pub fn commit(&self, operation: AtomicOperation<'_>) -> Result<(), StorageError> {
        let id = operation.id;
        let state = operation.take_state();
        let result = self.apply(id, &state);
        self.release_latches(id, &state.latches);

        if let Err(e) = &result {
            tracing::warn!(operation = id, error = %e, "atomic operation failed to commit");
            self.delete_files(&state.created_files);
        }
        result
    }

    /// Discard every page written by `operation`.
    pub fn rollback(&self, operation: AtomicOperation<'_>) {
        let id = operation.id;
        let state = operation.take_state();
        self.discard(id, state);
    }

    fn discard(&self, id: u64, state: OperationState) {
        if !state.pages.is_empty() || !state.created_files.is_empty() {
            tracing::warn!(
                operation = id,
                pages = state.pages.len(),
                "atomic operation rolled back"
            );
        }
        self.delete_files(&state.created_files);
        self.release_latches(id, &state.latches);
    }

    fn delete_files(&self, files: &[FileId]) {
        for &file_id in files {
            if let Err(e) = self.store.delete_file(file_id) {
                tracing::warn!(file = file_id, error = %e, "failed to delete file of failed operation");
            }
        }
    }

    fn apply(&self, id: u64, state: &OperationState) -> Result<(), StorageError> {
        let deleted: HashSet<FileId> = state.deleted_files.iter().copied().collect();
        let mut journal = self.lock_journal();

        if !state.pages.is_empty() {
            let mut images = Vec::with_capacity(state.pages.len());
            for (&(file_id, page_index), page) in &state.pages {
                if !deleted.contains(&file_id) {
                    images.push((file_id, page_index, page.clone()));
                }
            }

            if let Some(wal) = journal.as_mut() {
                let journal_start = wal.size_bytes();
                wal.append(id, LogRecordPayload::Begin)?;
                for (file_id, page_index, page) in &mut images {
                    page.set_journal_position(0, wal.next_lsn());
                    wal.append(
                        id,
                        LogRecordPayload::PageImage {
                            file_name: self.store.file_name(*file_id)?,
                            page_index: *page_index,
                            image: page.as_bytes().to_vec(),
                        },
                    )?;
                }
                wal.append(id, LogRecordPayload::Commit)?;
                wal.sync()?;
                self.lock_checkpoints()
                    .record_commit(wal.size_bytes() - journal_start);
            }

            for (file_id, page_index, page) in &images {
                self.store.write_page(*file_id, *page_index, page)?;
            }
            if self.sync_on_commit {
                self.store.sync()?;
            }
            tracing::trace!(operation = id, pages = images.len(), "atomic operation committed");

            if let Some(wal) = journal.as_mut() {
                let mut checkpoints = self.lock_checkpoints();
                if checkpoints.should_checkpoint() {
                    self.store.sync()?;
                    let journaled = wal.size_bytes();
                    wal.reset()?;
                    checkpoints.checkpoint_completed();
                    tracing::debug!(operation = id, bytes = journaled, "journal checkpoint");
                }
            }
        }

        if !deleted.is_empty() {
            for &file_id in &deleted {
                self.store.delete_file(file_id)?;
            }
            // Older images of the deleted files must not be replayed.
            if let Some(wal) = journal.as_mut() {
                self.store.sync()?;
                wal.reset()?;
            }
        }
        Ok(())
    }

    /// Sync the store and drop journal records that are no longer needed.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let mut journal = self.lock_journal();
        self.store.sync()?;
        if let Some(wal) = journal.as_mut() {
            wal.reset()?;
            self.lock_checkpoints().checkpoint_completed();
        }
        Ok(())
    }

    /// Take the shared latch of `component`, waiting while an operation holds
    /// it exclusively.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn acquire_read_lock(&self, component: &str) -> ComponentReadGuard<'_> {
        let mut latches = self.lock_latches();
        loop {
            let latch = latches.entry(component.to_string()).or_default();
            let owned_elsewhere = latch
                .owner
                .is_some_and(|(_, thread)| thread != std::thread::current().id());
            if !owned_elsewhere {
                latch.readers += 1;
                break;
            }
            latches = self
                .latch_released
                .wait(latches)
                .expect("latch table lock poisoned");
        }
        ComponentReadGuard {
            manager: self,
            component: component.to_string(),
        }
    }

    /// Take the exclusive latch of `component` until `operation` commits or
    /// rolls back. Re-acquiring a latch the operation already holds is a no-op.
    ///
    /// # Errors
    ///
    /// [`StorageError::LatchHeldByThread`] if another operation of the calling
    /// thread holds the latch; waiting would never return.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn acquire_exclusive_lock_till_operation_complete(
        &self,
        operation: &AtomicOperation<'_>,
        component: &str,
    ) -> Result<(), StorageError> {
        let thread = std::thread::current().id();
        let mut latches = self.lock_latches();
        loop {
            let latch = latches.entry(component.to_string()).or_default();
            match latch.owner {
                Some((id, _)) if id == operation.id => return Ok(()),
                Some((id, owner)) if owner == thread => {
                    return Err(StorageError::LatchHeldByThread {
                        component: component.to_string(),
                        holder: id,
                        requester: operation.id,
                    });
                }
                _ => {}
            }
            if latch.owner.is_none() && latch.readers == 0 {
                latch.owner = Some((operation.id, thread));
                break;
            }
            latches = self
                .latch_released
                .wait(latches)
                .expect("latch table lock poisoned");
        }
        drop(latches);
        operation
            .state
            .borrow_mut()
            .latches
            .push(component.to_string());
        Ok(())
    }

    fn release_latches(&self, id: u64, components: &[String]) {
        if components.is_empty() {
            return;
        }
        let mut latches = self.lock_latches();
        for component in components {
            if let Some(latch) = latches.get_mut(component) {
                if latch.owner.is_some_and(|(owner, _)| owner == id) {
                    latch.owner = None;
                }
            }
        }
        drop(latches);
        self.latch_released.notify_all();
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_latches(&self) -> MutexGuard<'_, HashMap<String, ComponentLatch>> {
        self.latches.lock().expect("latch table lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_journal(&self) -> MutexGuard<'_, Option<Journal>> {
        self.journal.lock().expect("journal lock poisoned")
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_checkpoints(&self) -> MutexGuard<'_, CheckpointState> {
        self.checkpoints.lock().expect("checkpoint lock poisoned")
    }
}

impl PageSource for AtomicOperationsManager {
    fn load_for_read(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<ReadEntry<'_>, StorageError> {
        let page = self.store.read_page(file_id, page_index)?;
        Ok(ReadEntry::new(page, &self.pins))
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError> {
        self.store.filled_up_to(file_id)
    }
}
