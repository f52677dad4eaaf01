//! Crash recovery from the page-image journal.
//!
//! # Recovery Process
//!
//! 1. Read every valid journal record
//! 2. Group page images by atomic operation
//! 3. On each COMMIT record, write that operation's images to the page store
//!    in journal order (operations commit serially, so this is commit order)
//! 4. Discard operations without a COMMIT record
//! 5. Sync the store and reset the journal
//!
//! Replaying an image that already reached the store is harmless: images are
//! full pages, so redo is idempotent.

use std::collections::HashMap;

use crate::storage::io::{PageStore, StorageError};
use crate::storage::page::{Page, PageIndex};
use crate::storage::wal::{LogFile, LogRecordPayload, Lsn, Wal, WalError};

/// Result of a recovery run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of journal records scanned.
    pub records_scanned: usize,
    /// Number of committed operations replayed.
    pub operations_replayed: usize,
    /// Number of uncommitted operations discarded.
    pub operations_discarded: usize,
    /// Number of page images written to the store.
    pub pages_applied: usize,
    /// Highest LSN seen.
    pub recovered_lsn: Lsn,
}

/// Page images of one operation waiting for its COMMIT record.
#[derive(Debug, Default)]
struct PendingOperation {
    images: Vec<(String, PageIndex, Vec<u8>)>,
}

/// Replay committed operations from `wal` into `store`, then reset the journal.
pub fn recover<F: LogFile>(
    store: &dyn PageStore,
    wal: &mut Wal<F>,
) -> Result<RecoveryResult, StorageError> {
    let records = wal.read_all()?;
    let mut result = RecoveryResult {
        records_scanned: records.len(),
        ..RecoveryResult::default()
    };
    if records.is_empty() {
        return Ok(result);
    }

    let mut pending: HashMap<u64, PendingOperation> = HashMap::new();
    for record in records {
        result.recovered_lsn = result.recovered_lsn.max(record.lsn);

        match record.payload {
            LogRecordPayload::Begin => {
                pending.insert(record.operation_id, PendingOperation::default());
            }
            LogRecordPayload::PageImage {
                file_name,
                page_index,
                image,
            } => {
                if let Some(operation) = pending.get_mut(&record.operation_id) {
                    operation.images.push((file_name, page_index, image));
                }
            }
            LogRecordPayload::Commit => {
                let Some(operation) = pending.remove(&record.operation_id) else {
                    continue;
                };
                for (file_name, page_index, image) in operation.images {
                    let page = Page::from_slice(&image)
                        .ok_or(StorageError::Wal(WalError::CorruptRecord))?;
                    let file_id = if store.exists(&file_name) {
                        store.open_file(&file_name)?
                    } else {
                        store.add_file(&file_name)?
                    };
                    store.write_page(file_id, page_index, &page)?;
                    result.pages_applied += 1;
                }
                result.operations_replayed += 1;
            }
        }
    }
    result.operations_discarded = pending.len();

    store.sync()?;
    wal.reset()?;

    tracing::info!(
        records = result.records_scanned,
        replayed = result.operations_replayed,
        discarded = result.operations_discarded,
        pages = result.pages_applied,
        "journal recovery complete"
    );
    Ok(result)
}
