//! Directory-backed page store.
//!
//! Each store file is one OS file inside the store directory. Pages are
//! sealed with the page magic and a CRC32 on write and verified on read, so a
//! torn or bit-rotted page surfaces as a checksum error instead of garbage.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::storage::io::{FileId, PageStore, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageIndex};

struct OpenFile {
    name: String,
    file: File,
    pages: u64,
}

struct OpenFiles {
    files: HashMap<FileId, OpenFile>,
    names: HashMap<String, FileId>,
    next_file_id: FileId,
}

impl OpenFiles {
    fn get_mut(&mut self, file_id: FileId) -> Result<&mut OpenFile, StorageError> {
        self.files
            .get_mut(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))
    }

    fn register(&mut self, name: &str, file: File, pages: u64) -> FileId {
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        self.names.insert(name.to_string(), file_id);
        self.files.insert(
            file_id,
            OpenFile {
                name: name.to_string(),
                file,
                pages,
            },
        );
        file_id
    }
}

/// Page store keeping one OS file per store file.
pub struct FilePageStore {
    directory: PathBuf,
    inner: Mutex<OpenFiles>,
}

impl FilePageStore {
    /// Open (creating if needed) a store rooted at `directory`.
    pub fn open(directory: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            inner: Mutex::new(OpenFiles {
                files: HashMap::new(),
                names: HashMap::new(),
                next_file_id: 1,
            }),
        })
    }

    /// Directory holding the store files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, OpenFiles> {
        self.inner.lock().expect("file page store lock poisoned")
    }
}

impl PageStore for FilePageStore {
    fn add_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut inner = self.lock();
        let path = self.path_of(name);
        if inner.names.contains_key(name) || path.exists() {
            return Err(StorageError::FileExists(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(inner.register(name, file, 0))
    }

    fn open_file(&self, name: &str) -> Result<FileId, StorageError> {
        let mut inner = self.lock();
        if let Some(&file_id) = inner.names.get(name) {
            return Ok(file_id);
        }

        let path = self.path_of(name);
        if !path.exists() {
            return Err(StorageError::FileNotFound(name.to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let pages = file.metadata()?.len() / PAGE_SIZE_U64;
        Ok(inner.register(name, file, pages))
    }

    fn exists(&self, name: &str) -> bool {
        self.lock().names.contains_key(name) || self.path_of(name).exists()
    }

    fn delete_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let open = inner
            .files
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        inner.names.remove(&open.name);
        drop(open.file);
        std::fs::remove_file(self.path_of(&open.name))?;
        Ok(())
    }

    fn close_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let open = inner
            .files
            .remove(&file_id)
            .ok_or(StorageError::UnknownFile(file_id))?;
        inner.names.remove(&open.name);
        open.file.sync_all()?;
        Ok(())
    }

    fn file_name(&self, file_id: FileId) -> Result<String, StorageError> {
        let mut inner = self.lock();
        Ok(inner.get_mut(file_id)?.name.clone())
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        Ok(inner.get_mut(file_id)?.pages)
    }

    fn read_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Page, StorageError> {
        let mut inner = self.lock();
        let open = inner.get_mut(file_id)?;
        if page_index >= open.pages {
            return Err(StorageError::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to: open.pages,
            });
        }

        let mut page = Page::new();
        open.file.seek(SeekFrom::Start(page_index * PAGE_SIZE_U64))?;
        open.file.read_exact(page.as_bytes_mut())?;

        page.verify().map_err(|mismatch| StorageError::Checksum {
            file_id,
            page_index,
            mismatch,
        })?;
        Ok(page)
    }

    fn write_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let open = inner.get_mut(file_id)?;

        if page_index > open.pages {
            // Zero-fill the gap so intermediate pages read back as never written.
            open.file.set_len(page_index * PAGE_SIZE_U64)?;
        }

        let mut sealed = page.clone();
        sealed.seal();
        open.file.seek(SeekFrom::Start(page_index * PAGE_SIZE_U64))?;
        open.file.write_all(sealed.as_bytes())?;

        open.pages = open.pages.max(page_index + 1);
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let inner = self.lock();
        for open in inner.files.values() {
            open.file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip_across_reopen() {
        let dir = tempdir().expect("Failed to create temp dir");

        {
            let store = FilePageStore::open(dir.path()).expect("open store");
            let id = store.add_file("tree.cbt").expect("add file");
            let mut page = Page::new();
            page.write_i64(40, -5);
            store.write_page(id, 0, &page).expect("write page");
            store.sync().expect("sync");
        }

        let store = FilePageStore::open(dir.path()).expect("reopen store");
        let id = store.open_file("tree.cbt").expect("open file");
        assert_eq!(store.filled_up_to(id).expect("size"), 1);
        assert_eq!(store.read_page(id, 0).expect("read page").read_i64(40), -5);
    }

    #[test]
    fn test_gap_pages_read_as_zero() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FilePageStore::open(dir.path()).expect("open store");
        let id = store.add_file("tree.cbt").expect("add file");

        store.write_page(id, 3, &Page::new()).expect("write page");

        assert_eq!(store.filled_up_to(id).expect("size"), 4);
        assert!(store.read_page(id, 1).expect("gap page").is_zeroed());
    }

    #[test]
    fn test_corrupted_page_detected() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FilePageStore::open(dir.path()).expect("open store");
        let id = store.add_file("tree.cbt").expect("add file");

        let mut page = Page::new();
        page.write_i32(100, 1);
        store.write_page(id, 0, &page).expect("write page");
        store.close_file(id).expect("close");

        let path = dir.path().join("tree.cbt");
        let mut bytes = std::fs::read(&path).expect("read raw file");
        bytes[200] ^= 0xFF;
        std::fs::write(&path, bytes).expect("write raw file");

        let id = store.open_file("tree.cbt").expect("reopen file");
        assert!(matches!(
            store.read_page(id, 0),
            Err(StorageError::Checksum { .. })
        ));
    }

    #[test]
    fn test_delete_removes_os_file() {
        let dir = tempdir().expect("Failed to create temp dir");
        let store = FilePageStore::open(dir.path()).expect("open store");
        let id = store.add_file("tree.nbt").expect("add file");

        store.delete_file(id).expect("delete");

        assert!(!dir.path().join("tree.nbt").exists());
        assert!(!store.exists("tree.nbt"));
    }
}
