//! Store construction.
//!
//! Multiple in-process opens of the same database share one instance; the
//! factory owns that cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::disk::{FileStore, FileStoreConfig};
use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::ContentAddressedStore;

/// Capability interface for opening per-database stores.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open_store(&self, db_id: &str) -> Result<Arc<dyn ContentAddressedStore>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory factory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStoreFactory {
    open: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open_store(&self, db_id: &str) -> Result<Arc<dyn ContentAddressedStore>, StoreError> {
        let mut open = self.open.lock().await;
        let store = open
            .entry(db_id.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(db_id)))
            .clone();
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// On-disk factory
// ---------------------------------------------------------------------------

/// Opens `FileStore`s under `root/<db_id>/`.
pub struct FileStoreFactory {
    root: PathBuf,
    config: FileStoreConfig,
    open: Mutex<HashMap<String, Arc<FileStore>>>,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, FileStoreConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: FileStoreConfig) -> Self {
        Self {
            root: root.into(),
            config,
            open: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn open_store(&self, db_id: &str) -> Result<Arc<dyn ContentAddressedStore>, StoreError> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(db_id) {
            return Ok(store.clone());
        }
        let store = Arc::new(FileStore::open_with_config(
            self.root.join(db_id),
            db_id,
            self.config,
        )?);
        open.insert(db_id.to_string(), store.clone());
        Ok(store)
    }
}
