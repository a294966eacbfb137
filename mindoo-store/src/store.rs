//! The store contract: every backend (in-memory, on-disk, remote peer)
//! speaks this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mindoo_crypto::b64;

use crate::bloom::BloomSummary;
use crate::entry::{EntryType, StoreEntry, StoreEntryMetadata};
use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Scan cursor
// ---------------------------------------------------------------------------

/// Position in the `(createdAt asc, id asc)` scan order. Opaque to callers;
/// the encoded form is what crosses the wire.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanCursor {
    pub created_at: i64,
    pub id: String,
}

impl ScanCursor {
    /// Encode to the opaque wire form.
    pub fn encode(&self) -> String {
        b64::encode(format!("{}|{}", self.created_at, self.id).as_bytes())
    }

    /// Decode the opaque wire form. Partial.
    pub fn decode(cursor: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidCursor(cursor.to_string());
        let raw = b64::decode(cursor).map_err(|_| invalid())?;
        let text = String::from_utf8(raw).map_err(|_| invalid())?;
        let (ts, id) = text.split_once('|').ok_or_else(invalid)?;
        let created_at = ts.parse::<i64>().map_err(|_| invalid())?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

/// Optional narrowing of a cursor scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl ScanFilters {
    pub fn matches(&self, meta: &StoreEntryMetadata) -> bool {
        if let Some(t) = self.entry_type {
            if meta.entry_type != t {
                return false;
            }
        }
        if let Some(doc_id) = &self.doc_id {
            if &meta.doc_id != doc_id {
                return false;
            }
        }
        true
    }
}

/// One page of a cursor scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPage {
    pub entries: Vec<StoreEntryMetadata>,
    /// Cursor for the next page; `None` only when `has_more` is false and
    /// nothing was yielded.
    pub next_cursor: Option<String>,
    /// False iff no entry follows this page.
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Compaction status
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionStatus {
    pub total_entries: u64,
    pub total_compactions: u64,
    /// ms since epoch of the last metadata compaction, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compaction_at: Option<i64>,
    /// Number of metadata segments currently on disk.
    pub segment_count: u64,
    pub reclaimed_bytes: u64,
}

// ---------------------------------------------------------------------------
// Dependency resolution
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOptions {
    /// Follow dependencies of dependencies. Defaults to true.
    pub transitive: bool,
    /// Upper bound on the number of returned ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            transitive: true,
            limit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// The store trait
// ---------------------------------------------------------------------------

/// Durable, append-only, content-addressed entry store for one database.
///
/// Entries are immutable once written; `put_entries` deduplicates by id and
/// is durable before it returns. All discovery calls operate on metadata
/// only; `get_entries` is the single ciphertext-bearing read.
#[async_trait]
pub trait ContentAddressedStore: Send + Sync {
    /// Identity of this store (the database id). Pull/push between stores
    /// with different ids is refused upstream.
    fn store_id(&self) -> &str;

    /// Append entries. No-op per entry whose id already exists. Fails the
    /// whole batch (writing nothing) if any entry fails validation.
    async fn put_entries(&self, entries: &[StoreEntry]) -> Result<(), StoreError>;

    /// Fetch full entries. Missing ids are silently dropped.
    async fn get_entries(&self, ids: &[String]) -> Result<Vec<StoreEntry>, StoreError>;

    /// Metadata of entries not in `have_ids`, in scan order.
    async fn find_new_entries(
        &self,
        have_ids: &[String],
    ) -> Result<Vec<StoreEntryMetadata>, StoreError>;

    /// Like `find_new_entries`, scoped to one document.
    async fn find_new_entries_for_doc(
        &self,
        have_ids: &[String],
        doc_id: &str,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError>;

    /// Metadata by entry type and creation-time range (inclusive bounds).
    async fn find_entries(
        &self,
        entry_type: EntryType,
        from_ms: Option<i64>,
        until_ms: Option<i64>,
    ) -> Result<Vec<StoreEntryMetadata>, StoreError>;

    /// Ordered cursor scan over all metadata. The cursor is opaque and
    /// monotonic: resuming from `next_cursor` never re-yields an entry.
    async fn scan_entries_since(
        &self,
        cursor: Option<&str>,
        limit: usize,
        filters: Option<&ScanFilters>,
    ) -> Result<ScanPage, StoreError>;

    /// Probabilistic summary of all current ids.
    async fn get_id_bloom_summary(&self) -> Result<BloomSummary, StoreError>;

    async fn get_compaction_status(&self) -> Result<CompactionStatus, StoreError>;

    /// Backward closure of the dependency DAG from `start_id` (exclusive).
    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: Option<&ResolveOptions>,
    ) -> Result<Vec<String>, StoreError>;

    /// Complete id snapshot, in scan order. Intended for small stores and
    /// tests.
    async fn get_all_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Subset of `ids` present, preserving the input order.
    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let c = ScanCursor {
            created_at: 1_700_000_000_123,
            id: "abc_d_0_ff".into(),
        };
        let encoded = c.encode();
        assert_eq!(ScanCursor::decode(&encoded).unwrap(), c);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(ScanCursor::decode("!!!not-base64!!!").is_err());
        assert!(ScanCursor::decode(&b64::encode(b"no-separator")).is_err());
        assert!(ScanCursor::decode(&b64::encode(b"nan|id")).is_err());
        assert!(ScanCursor::decode(&b64::encode(b"123|")).is_err());
    }

    #[test]
    fn test_cursor_ordering_matches_scan_key() {
        let a = ScanCursor { created_at: 1, id: "b".into() };
        let b = ScanCursor { created_at: 1, id: "c".into() };
        let c = ScanCursor { created_at: 2, id: "a".into() };
        assert!(a < b && b < c);
    }
}
