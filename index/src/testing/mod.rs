use std::sync::{Arc, Once};

use crate::btree::SingleValueTree;
use crate::config::IndexConfig;
use crate::key::{KeyCodec, KeyType};
use crate::storage::{AtomicOperationsManager, MemoryPageStore, PageStore};

static TRACING: Once = Once::new();

/// Route `tracing` output of the tests through `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Manager over a fresh in-memory store.
pub fn memory_manager() -> Arc<AtomicOperationsManager> {
    memory_manager_with(Arc::new(MemoryPageStore::new()))
}

pub fn memory_manager_with(store: Arc<dyn PageStore>) -> Arc<AtomicOperationsManager> {
    init_tracing();
    let config = IndexConfig::default().with_sync_on_commit(false);
    Arc::new(AtomicOperationsManager::new(store).with_config(&config))
}

/// Create and commit an empty tree called `name`.
pub fn create_tree<C: KeyCodec>(
    manager: &Arc<AtomicOperationsManager>,
    name: &str,
    codec: C,
    config: IndexConfig,
    key_types: Option<Vec<KeyType>>,
    key_arity: usize,
) -> SingleValueTree<C> {
    let tree = SingleValueTree::new(name, Arc::clone(manager), codec, config).expect("valid config");
    let op = manager.start_atomic_operation();
    tree.create(&op, key_types, key_arity).expect("create tree");
    manager.commit(op).expect("commit create");
    tree
}
