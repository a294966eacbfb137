//! In-memory store (tests and ephemeral peers).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::bloom::BloomSummary;
use crate::entry::{EntryType, StoreEntry, StoreEntryMetadata};
use crate::error::StoreError;
use crate::index::MetaIndex;
use crate::store::{
    CompactionStatus, ContentAddressedStore, ResolveOptions, ScanCursor, ScanFilters, ScanPage,
};

pub struct MemoryStore {
    store_id: String,
    inner: RwLock<MemInner>,
}

struct MemInner {
    index: MetaIndex,
    entries: HashMap<String, StoreEntry>,
}

impl MemoryStore {
    pub fn new(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            inner: RwLock::new(MemInner {
                index: MetaIndex::new(),
                entries: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ContentAddressedStore for MemoryStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn put_entries(&self, entries: &[StoreEntry]) -> Result<(), StoreError> {
        for entry in entries {
            entry.validate()?;
        }
        let mut inner = self.inner.write().await;
        for entry in entries {
            if inner.index.insert(entry.metadata()) {
                inner.entries.insert(entry.id.clone(), entry.clone());
            }
        }
        Ok(())
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<StoreEntry>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .cloned()
            .collect())
    }

    async fn find_new_entries(
        &self,
        have_ids: &[String],
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self.inner.read().await.index.find_new(have_ids))
    }

    async fn find_new_entries_for_doc(
        &self,
        have_ids: &[String],
        doc_id: &str,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self.inner.read().await.index.find_new_for_doc(have_ids, doc_id))
    }

    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .index
            .find_by_type(entry_type, from_ms, until_ms))
    }

    async fn scan_entries_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> Result<ScanPage, StoreError> {
        let decoded = cursor.map(ScanCursor::decode).transpose()?;
        Ok(self
            .inner
            .read()
            .await
            .index
            .scan_after(decoded.as_ref(), limit, filters))
    }

    async fn get_id_bloom_summary(&self) -> Result<BloomSummary, StoreError> {
        Ok(self.inner.read().await.index.bloom_summary())
    }

    async fn get_compaction_status(&self) -> Result<CompactionStatus, StoreError> {
        let inner = self.inner.read().await;
        Ok(CompactionStatus {
            total_entries: inner.index.len() as u64,
            ..Default::default()
        })
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: Option<&ResolveOptions>,
    ) -> Result<Vec<String>, StoreError> {
        let default = ResolveOptions::default();
        Ok(self
            .inner
            .read()
            .await
            .index
            .resolve_dependencies(start_id, options.unwrap_or(&default)))
    }

    async fn get_all_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.index.all_ids())
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter(|id| inner.index.contains(id))
            .cloned()
            .collect())
    }
}
