//! In-memory page store with optional fault injection.
//!
//! Files live in a map guarded by one mutex. Faults are drawn from a seeded
//! RNG so a failing run can be replayed with the same seed:
//! - page read errors
//! - page write errors
//! - sync errors
//!
//! Closing a file keeps its pages, so a closed index can be loaded again
//! from the same store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{FileId, PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};

/// Configuration for fault injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults.
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Fail every page read.
    #[must_use]
    pub const fn failing_reads() -> Self {
        Self {
            read_error_rate: 1.0,
            write_error_rate: 0.0,
            sync_error_rate: 0.0,
        }
    }
}

/// Counters of store activity.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub injected_faults: u64,
}

struct MemoryFile {
    name: String,
    pages: Vec<Page>,
}

struct MemoryFiles {
    files: HashMap<FileId, MemoryFile>,
    names: HashMap<String, FileId>,
    next_file_id: FileId,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStoreStats,
}

impl MemoryFiles {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let hit = self.rng.random::<f64>() < rate;
        if hit {
            self.stats.injected_faults += 1;
        }
        hit
    }

    fn file(&self, file_id: FileId) -> Result<&MemoryFile, StorageError> {
        self.files
            .get(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn file_mut(&mut self, file_id: FileId) -> Result<&mut MemoryFile, StorageError> {
        self.files
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }
}

/// Page store that keeps every file in memory.
pub struct MemoryPageStore {
    inner: Mutex<MemoryFiles>,
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPageStore {
    /// Create an empty store without fault injection.
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(0, FaultConfig::default())
    }

    /// Create an empty store injecting faults drawn from `seed`.
    #[must_use]
    pub fn with_faults(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            inner: Mutex::new(MemoryFiles {
                files: HashMap::new(),
                names: HashMap::new(),
                next_file_id: 1,
                fault_config,
                rng: StdRng::seed_from_u64(seed),
                stats: MemoryStoreStats::default(),
            }),
        }
    }

    /// Replace the fault configuration.
    pub fn set_fault_config(&self, fault_config: FaultConfig) {
        self.lock().fault_config = fault_config;
    }

    /// Current activity counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, MemoryFiles> {
        self.inner.lock().expect("memory page store lock poisoned")
    }
}

impl PageStore for MemoryPageStore {
    fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut inner = self.lock();
        if inner.names.contains_key(name) {
            return Err(StorageError::FileExists(name.to_string()));
        }
        let file_id = inner.next_file_id;
        inner.next_file_id += 1;
        inner.names.insert(name.to_string(), file_id);
        inner.files.insert(
            file_id,
            MemoryFile {
                name: name.to_string(),
                pages: Vec::new(),
            },
        );
        Ok(file_id)
    }

    fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        self.lock()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    fn exists(&self, name: &str) -> bool {
        self.lock().names.contains_key(name)
    }

    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let file = inner
            .files
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        inner.names.remove(&file.name);
        Ok(())
    }

    fn close_file(&self, file_id: FileId) -> Result<(), StorageError> {
        self.lock().file(file_id).map(|_| ())
    }

    fn file_name(&self, file_id: FileId) -> Result<String, StorageError> {
        Ok(self.lock().file(file_id)?.name.clone())
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError> {
        Ok(self.lock().file(file_id)?.pages.len() as u64)
    }

    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError> {
        let mut inner = self.lock();
        inner.stats.reads += 1;

        let read_error_rate = inner.fault_config.read_error_rate;
        if inner.should_inject_fault(read_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let file = inner.file(file_id)?;
        usize::try_from(page_index)
            .ok()
            .and_then(|index| file.pages.get(index))
            .cloned()
            .ok_or(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to: file.pages.len() as u64,
            })
    }

    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.stats.writes += 1;

        let write_error_rate = inner.fault_config.write_error_rate;
        if inner.should_inject_fault(write_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let file = inner.file_mut(file_id)?;
        let index = usize::try_from(page_index).map_err(|_| StorageError::PageOutOfBounds {
            file_id,
            page_index,
            filled_up_to: file.pages.len() as u64,
        })?;
        if index >= file.pages.len() {
            file.pages.resize_with(index + 1, Page::new);
        }
        file.pages[index] = page.clone();
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.stats.syncs += 1;

        let sync_error_rate = inner.fault_config.sync_error_rate;
        if inner.should_inject_fault(sync_error_rate) {
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }
        Ok(())
    }
}
