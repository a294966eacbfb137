//! Per-database document engine.
//!
//! Projects the per-document entry sequence into CRDT document state, emits
//! local writes as signed encrypted entries, and keeps the sorted
//! modification index that cursor processing walks. One engine instance per
//! open database; mutations serialize on the internal state mutex.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use async_trait::async_trait;
use mindoo_crypto::aead::{self, KEY_BYTES};
use mindoo_crypto::{sign, SigningKey, VerifyingKey};
use mindoo_store::{idcodec, ContentAddressedStore, EntryType, StoreEntry};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crdt::{CrdtDoc, CrdtProvider};
use crate::error::DbError;
use crate::keybag::{KeyBag, KeyKind, DEFAULT_KEY_ID};
use crate::identity::CurrentUser;
use crate::payload::DocumentData;

/// Hidden payload key carried by delete tombstone changes. Reads of a
/// deleted document fail before the payload is ever exposed.
const TOMBSTONE_KEY: &str = "_deleted";

// ---------------------------------------------------------------------------
// Trust resolution
// ---------------------------------------------------------------------------

/// Answers whether a signing key is currently trusted. The directory
/// implements this; admin-only databases never consult it (only the admin
/// key may author entries there).
#[async_trait]
pub trait TrustResolver: Send + Sync {
    async fn validate_public_signing_key(&self, pem: &str) -> bool;
}

/// Trust resolver for admin-only databases: nobody beyond the admin key
/// (which the engine always trusts) is accepted.
pub struct AdminOnlyTrust;

#[async_trait]
impl TrustResolver for AdminOnlyTrust {
    async fn validate_public_signing_key(&self, _pem: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Cursors and summaries
// ---------------------------------------------------------------------------

/// Position in the `(lastModified, docId)` document-change order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocCursor {
    pub last_modified: i64,
    pub doc_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocChangeSummary {
    pub doc_id: String,
    pub last_modified: i64,
    pub is_deleted: bool,
}

/// Projection metadata of a document, without its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentInfo {
    pub doc_id: String,
    pub created_at: i64,
    pub last_modified: i64,
    pub decryption_key_id: String,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

struct DocState {
    doc: Box<dyn CrdtDoc>,
    created_at: i64,
    last_modified: i64,
    decryption_key_id: String,
    is_deleted: bool,
    valid_entries: usize,
    /// CRDT change hash → entry id, for dependency resolution of new local
    /// writes.
    hash_to_entry: HashMap<String, String>,
}

struct DbState {
    docs: HashMap<String, DocState>,
    /// Sorted `(lastModified, docId, isDeleted)`; binary-search insertion on
    /// each document refresh.
    doc_index: Vec<(i64, String, bool)>,
    processed_ids: Vec<String>,
    processed_set: HashSet<String>,
}

/// Construction parameters, filled in by the tenant.
pub struct DatabaseParams {
    pub db_id: String,
    pub tenant_id: String,
    pub admin_only: bool,
    pub store: Arc<dyn ContentAddressedStore>,
    pub crdt: Arc<dyn CrdtProvider>,
    pub keys: Arc<KeyBag>,
    pub user: Arc<CurrentUser>,
    pub admin_key: VerifyingKey,
    pub trust: Arc<dyn TrustResolver>,
}

pub struct Database {
    db_id: String,
    tenant_id: String,
    admin_only: bool,
    store: Arc<dyn ContentAddressedStore>,
    crdt: Arc<dyn CrdtProvider>,
    keys: Arc<KeyBag>,
    user: Arc<CurrentUser>,
    admin_key: VerifyingKey,
    trust: Arc<dyn TrustResolver>,
    state: Mutex<DbState>,
    /// Bumped whenever new entries are folded in; trust caches key off it.
    generation: AtomicU64,
}

impl Database {
    pub fn new(params: DatabaseParams) -> Self {
        Self {
            db_id: params.db_id,
            tenant_id: params.tenant_id,
            admin_only: params.admin_only,
            store: params.store,
            crdt: params.crdt,
            keys: params.keys,
            user: params.user,
            admin_key: params.admin_key,
            trust: params.trust,
            state: Mutex::new(DbState {
                docs: HashMap::new(),
                doc_index: Vec::new(),
                processed_ids: Vec::new(),
                processed_set: HashSet::new(),
            }),
            generation: AtomicU64::new(0),
        }
    }

    pub fn db_id(&self) -> &str {
        &self.db_id
    }

    pub fn is_admin_only(&self) -> bool {
        self.admin_only
    }

    pub fn store(&self) -> &Arc<dyn ContentAddressedStore> {
        &self.store
    }

    /// Monotonic counter of observed change batches (local or synced).
    pub fn change_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_document(&self, doc_id: &str) -> Result<DocumentData, DbError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let ds = state.docs.get(doc_id).expect("loaded");
        if ds.is_deleted {
            return Err(DbError::DocumentDeleted(doc_id.to_string()));
        }
        Ok(ds.doc.data())
    }

    /// Project the document as of `at_ms`, ordered `(createdAt, id)`.
    pub async fn get_document_at(&self, doc_id: &str, at_ms: i64) -> Result<DocumentData, DbError> {
        let ds = self
            .project_document(doc_id, Some(at_ms))
            .await?
            .ok_or_else(|| DbError::NotFound(format!("document {}", doc_id)))?;
        if ds.valid_entries == 0 {
            return Err(DbError::NotFound(format!("document {}", doc_id)));
        }
        if ds.is_deleted {
            return Err(DbError::DocumentDeleted(doc_id.to_string()));
        }
        Ok(ds.doc.data())
    }

    /// Projection metadata. Unlike [`get_document`], this also answers for
    /// deleted documents.
    pub async fn get_document_info(&self, doc_id: &str) -> Result<DocumentInfo, DbError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let ds = &state.docs[doc_id];
        Ok(DocumentInfo {
            doc_id: doc_id.to_string(),
            created_at: ds.created_at,
            last_modified: ds.last_modified,
            decryption_key_id: ds.decryption_key_id.clone(),
            is_deleted: ds.is_deleted,
        })
    }

    /// Ids of all live (created, not deleted) documents, as projected from
    /// valid entries only.
    pub async fn get_all_document_ids(&self) -> Result<Vec<String>, DbError> {
        let metas = self.store.find_new_entries(&[]).await?;
        let doc_ids: BTreeSet<String> = metas.into_iter().map(|m| m.doc_id).collect();

        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        for doc_id in doc_ids {
            match self.ensure_loaded(&mut state, &doc_id).await {
                Ok(()) => {
                    let ds = &state.docs[&doc_id];
                    if ds.valid_entries > 0 && !ds.is_deleted {
                        out.push(doc_id);
                    }
                }
                Err(DbError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    pub async fn create_document(&self, data: DocumentData) -> Result<String, DbError> {
        let key = self.user.signing_key()?;
        self.create_document_inner(data, DEFAULT_KEY_ID, &key).await
    }

    /// Create a document sealed under a named key instead of the tenant key.
    pub async fn create_encrypted_document(
        &self,
        data: DocumentData,
        key_id: &str,
    ) -> Result<String, DbError> {
        if key_id == DEFAULT_KEY_ID {
            return Err(DbError::InvalidInput(format!(
                "key id '{}' is reserved",
                DEFAULT_KEY_ID
            )));
        }
        let key = self.user.signing_key()?;
        self.create_document_inner(data, key_id, &key).await
    }

    pub async fn create_document_with_signing_key(
        &self,
        data: DocumentData,
        signing_key: &SigningKey,
    ) -> Result<String, DbError> {
        self.create_document_inner(data, DEFAULT_KEY_ID, signing_key)
            .await
    }

    async fn create_document_inner(
        &self,
        data: DocumentData,
        key_id: &str,
        signing_key: &SigningKey,
    ) -> Result<String, DbError> {
        self.check_write_key(signing_key)?;
        if data.is_empty() {
            return Err(DbError::InvalidInput("document data must not be empty".into()));
        }

        let doc_id = idcodec::new_uuid7().to_string();
        let mut doc = self.crdt.init();
        let change = doc
            .transact(&mut |d| {
                for (k, v) in data.iter() {
                    d.set(k.clone(), v.clone());
                }
            })?
            .expect("non-empty create emits a change");

        let mut state = self.state.lock().await;
        let now = now_ms();
        let mut ds = DocState {
            doc,
            created_at: now,
            last_modified: now,
            decryption_key_id: key_id.to_string(),
            is_deleted: false,
            valid_entries: 0,
            hash_to_entry: HashMap::new(),
        };
        self.write_entry(&mut state, &mut ds, &doc_id, EntryType::DocCreate, change, signing_key)
            .await?;
        index_upsert(&mut state.doc_index, None, &doc_id, ds.last_modified, false);
        state.docs.insert(doc_id.clone(), ds);
        Ok(doc_id)
    }

    pub async fn change_document<F>(&self, doc_id: &str, mutator: F) -> Result<(), DbError>
    where
        F: FnMut(&mut DocumentData),
    {
        let key = self.user.signing_key()?;
        self.change_document_inner(doc_id, mutator, &key).await
    }

    pub async fn change_document_with_signing_key<F>(
        &self,
        doc_id: &str,
        mutator: F,
        signing_key: &SigningKey,
    ) -> Result<(), DbError>
    where
        F: FnMut(&mut DocumentData),
    {
        self.change_document_inner(doc_id, mutator, signing_key).await
    }

    async fn change_document_inner<F>(
        &self,
        doc_id: &str,
        mut mutator: F,
        signing_key: &SigningKey,
    ) -> Result<(), DbError>
    where
        F: FnMut(&mut DocumentData),
    {
        self.check_write_key(signing_key)?;
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let mut ds = state.docs.remove(doc_id).expect("loaded");
        if ds.is_deleted {
            state.docs.insert(doc_id.to_string(), ds);
            return Err(DbError::DocumentDeleted(doc_id.to_string()));
        }

        let result = ds.doc.transact(&mut mutator);
        let outcome = match result {
            Ok(Some(change)) => {
                let old_modified = ds.last_modified;
                match self
                    .write_entry(&mut state, &mut ds, doc_id, EntryType::DocChange, change, signing_key)
                    .await
                {
                    Ok(_) => {
                        index_upsert(
                            &mut state.doc_index,
                            Some(old_modified),
                            doc_id,
                            ds.last_modified,
                            ds.is_deleted,
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        state.docs.insert(doc_id.to_string(), ds);
        outcome
    }

    pub async fn delete_document(&self, doc_id: &str) -> Result<(), DbError> {
        let key = self.user.signing_key()?;
        self.delete_document_inner(doc_id, &key).await
    }

    pub async fn delete_document_with_signing_key(
        &self,
        doc_id: &str,
        signing_key: &SigningKey,
    ) -> Result<(), DbError> {
        self.delete_document_inner(doc_id, signing_key).await
    }

    async fn delete_document_inner(
        &self,
        doc_id: &str,
        signing_key: &SigningKey,
    ) -> Result<(), DbError> {
        self.check_write_key(signing_key)?;
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let mut ds = state.docs.remove(doc_id).expect("loaded");
        if ds.is_deleted {
            state.docs.insert(doc_id.to_string(), ds);
            return Err(DbError::AlreadyDeleted(doc_id.to_string()));
        }

        let result = ds
            .doc
            .transact(&mut |d| d.set(TOMBSTONE_KEY, true))
            .and_then(|change| {
                change.ok_or_else(|| DbError::InvalidInput("tombstone change was empty".into()))
            });
        let outcome = match result {
            Ok(change) => {
                let old_modified = ds.last_modified;
                match self
                    .write_entry(&mut state, &mut ds, doc_id, EntryType::DocDelete, change, signing_key)
                    .await
                {
                    Ok(_) => {
                        ds.is_deleted = true;
                        index_upsert(
                            &mut state.doc_index,
                            Some(old_modified),
                            doc_id,
                            ds.last_modified,
                            true,
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };
        state.docs.insert(doc_id.to_string(), ds);
        outcome
    }

    /// Encode the current CRDT state as a `doc_snapshot` entry, returning
    /// the entry id. Later loads start from the newest snapshot and apply
    /// only younger entries.
    pub async fn snapshot_document(&self, doc_id: &str) -> Result<String, DbError> {
        let signing_key = self.user.signing_key()?;
        self.check_write_key(&signing_key)?;
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let mut ds = state.docs.remove(doc_id).expect("loaded");

        let snapshot_bytes = ds.doc.save();
        let heads = ds.doc.get_heads();
        let change = crate::crdt::CrdtChange {
            hash: mindoo_crypto::hash::sha256_hex(&snapshot_bytes),
            bytes: snapshot_bytes,
            dep_hashes: heads,
        };
        let result = self
            .write_entry(&mut state, &mut ds, doc_id, EntryType::DocSnapshot, change, &signing_key)
            .await;
        state.docs.insert(doc_id.to_string(), ds);
        result
    }

    /// Seal one entry and append it to the store, returning its id. Shared
    /// tail of every local write path.
    async fn write_entry(
        &self,
        state: &mut DbState,
        ds: &mut DocState,
        doc_id: &str,
        entry_type: EntryType,
        change: crate::crdt::CrdtChange,
        signing_key: &SigningKey,
    ) -> Result<String, DbError> {
        let key = self.resolve_key(&ds.decryption_key_id)?;
        let encrypted_data = aead::seal_payload(&key, &change.bytes)?;
        let signature = sign::sign(signing_key, &encrypted_data);
        let author_pem = sign::verifying_key_to_pem(&signing_key.verifying_key())?;

        // Unknown dependency hashes are omitted; they reconcile at the next
        // store sync.
        let mut dependency_ids = Vec::new();
        for hash in &change.dep_hashes {
            match ds.hash_to_entry.get(hash) {
                Some(id) => dependency_ids.push(id.clone()),
                None => {
                    tracing::warn!(doc_id, hash = %hash, "dependency hash has no known entry; omitting")
                }
            }
        }

        let id = idcodec::doc_entry_id(doc_id, &change.hash, &change.dep_hashes);
        let created_at = now_ms();
        let entry = StoreEntry {
            entry_type,
            id: id.clone(),
            content_hash: idcodec::content_hash(&encrypted_data),
            doc_id: doc_id.to_string(),
            dependency_ids,
            created_at,
            created_by_public_key: author_pem,
            decryption_key_id: ds.decryption_key_id.clone(),
            signature,
            original_size: change.bytes.len() as u64,
            encrypted_size: encrypted_data.len() as u64,
            encrypted_data,
        };
        self.store.put_entries(&[entry]).await?;

        ds.hash_to_entry.insert(change.hash.clone(), id.clone());
        ds.last_modified = ds.last_modified.max(created_at);
        ds.valid_entries += 1;
        if state.processed_set.insert(id.clone()) {
            state.processed_ids.push(id.clone());
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// Store `bytes` as encrypted attachment chunks on `doc_id`. Returns the
    /// attachment file id.
    pub async fn put_attachment(
        &self,
        doc_id: &str,
        bytes: &[u8],
        chunk_size: usize,
    ) -> Result<Uuid, DbError> {
        if chunk_size == 0 {
            return Err(DbError::InvalidInput("chunk size must be positive".into()));
        }
        let signing_key = self.user.signing_key()?;
        self.check_write_key(&signing_key)?;

        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, doc_id).await?;
        let key_id = state.docs[doc_id].decryption_key_id.clone();
        let key = self.resolve_key(&key_id)?;
        let author_pem = sign::verifying_key_to_pem(&signing_key.verifying_key())?;

        let file_id = idcodec::new_uuid7();
        let mut entries = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            let encrypted_data = aead::seal_payload(&key, chunk)?;
            let signature = sign::sign(&signing_key, &encrypted_data);
            // Chunk ids are UUIDv7: generation order is reassembly order.
            let id = idcodec::attachment_chunk_id(doc_id, &file_id, None);
            entries.push(StoreEntry {
                entry_type: EntryType::AttachmentChunk,
                content_hash: idcodec::content_hash(&encrypted_data),
                id,
                doc_id: doc_id.to_string(),
                dependency_ids: Vec::new(),
                created_at: now_ms(),
                created_by_public_key: author_pem.clone(),
                decryption_key_id: key_id.clone(),
                signature,
                original_size: chunk.len() as u64,
                encrypted_size: encrypted_data.len() as u64,
                encrypted_data,
            });
        }
        self.store.put_entries(&entries).await?;
        for entry in &entries {
            if state.processed_set.insert(entry.id.clone()) {
                state.processed_ids.push(entry.id.clone());
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(file_id)
    }

    /// Reassemble an attachment. Unlike document loads, a bad chunk is an
    /// error: a hole in the byte stream is worse than no answer.
    pub async fn get_attachment(&self, doc_id: &str, file_id: &Uuid) -> Result<Vec<u8>, DbError> {
        let metas = self.store.find_new_entries_for_doc(&[], doc_id).await?;
        let mut chunks = Vec::new();
        for meta in metas {
            if meta.entry_type != EntryType::AttachmentChunk {
                continue;
            }
            let Some(parsed) = idcodec::parse_attachment_chunk_id(&meta.id) else {
                continue;
            };
            if &parsed.file_id == file_id {
                chunks.push((parsed.chunk_id, meta.id));
            }
        }
        if chunks.is_empty() {
            return Err(DbError::NotFound(format!("attachment {}", file_id)));
        }
        chunks.sort();

        let ids: Vec<String> = chunks.iter().map(|(_, id)| id.clone()).collect();
        let entries = self.store.get_entries(&ids).await?;
        if entries.len() != ids.len() {
            return Err(DbError::NotFound(format!("attachment {} is incomplete", file_id)));
        }

        let mut by_id: HashMap<&str, &StoreEntry> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();
        let mut out = Vec::new();
        for id in &ids {
            let entry = by_id.remove(id.as_str()).ok_or_else(|| {
                DbError::NotFound(format!("attachment chunk {} missing", id))
            })?;
            if !self.author_accepted(entry).await {
                return Err(DbError::InvalidSignature);
            }
            let key = self.resolve_key(&entry.decryption_key_id)?;
            out.extend_from_slice(&aead::open_payload(&key, &entry.encrypted_data)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Cursor processing
    // -----------------------------------------------------------------------

    /// Walk documents modified after `cursor`, up to `limit` summaries.
    /// Deleted documents are skipped but still advance the cursor.
    pub async fn process_changes_since(
        &self,
        cursor: Option<&DocCursor>,
        limit: usize,
    ) -> Result<(Vec<DocChangeSummary>, Option<DocCursor>), DbError> {
        self.sync_store_changes().await?;
        let state = self.state.lock().await;

        let start = match cursor {
            Some(c) => match state
                .doc_index
                .binary_search_by(|(lm, id, _)| (*lm, id.as_str()).cmp(&(c.last_modified, c.doc_id.as_str())))
            {
                Ok(pos) => pos + 1,
                Err(pos) => pos,
            },
            None => 0,
        };

        let mut summaries = Vec::new();
        let mut next_cursor = cursor.cloned();
        for (last_modified, doc_id, is_deleted) in state.doc_index[start..].iter() {
            if summaries.len() == limit {
                break;
            }
            next_cursor = Some(DocCursor {
                last_modified: *last_modified,
                doc_id: doc_id.clone(),
            });
            if *is_deleted {
                continue;
            }
            summaries.push(DocChangeSummary {
                doc_id: doc_id.clone(),
                last_modified: *last_modified,
                is_deleted: *is_deleted,
            });
        }
        Ok((summaries, next_cursor))
    }

    /// Page through all changes after `cursor`. Terminates when a page
    /// yields fewer than `page_size` summaries or the cursor stops moving.
    pub async fn iterate_changes_since(
        &self,
        cursor: Option<DocCursor>,
        page_size: usize,
    ) -> Result<(Vec<DocChangeSummary>, Option<DocCursor>), DbError> {
        let mut all = Vec::new();
        let mut cursor = cursor;
        loop {
            let (page, next) = self.process_changes_since(cursor.as_ref(), page_size).await?;
            let advanced = next != cursor;
            let short = page.len() < page_size;
            all.extend(page);
            cursor = next;
            if short || !advanced {
                return Ok((all, cursor));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Fold entries that appeared in the local store (e.g. via sync) into
    /// the engine: reload affected documents and refresh the index.
    /// Idempotent; concurrent calls serialize on the state mutex.
    pub async fn sync_store_changes(&self) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        let new_metas = self.store.find_new_entries(&state.processed_ids).await?;
        if new_metas.is_empty() {
            return Ok(());
        }

        let affected: BTreeSet<String> = new_metas
            .iter()
            .filter(|m| m.entry_type != EntryType::AttachmentChunk)
            .map(|m| m.doc_id.clone())
            .collect();

        for doc_id in affected {
            let old = state.docs.remove(&doc_id);
            let old_modified = old.map(|ds| ds.last_modified);
            match self.project_document(&doc_id, None).await? {
                Some(ds) if ds.valid_entries > 0 => {
                    index_upsert(
                        &mut state.doc_index,
                        old_modified,
                        &doc_id,
                        ds.last_modified,
                        ds.is_deleted,
                    );
                    state.docs.insert(doc_id, ds);
                }
                _ => {
                    if let Some(old_modified) = old_modified {
                        index_remove(&mut state.doc_index, old_modified, &doc_id);
                    }
                }
            }
        }

        for meta in new_metas {
            if state.processed_set.insert(meta.id.clone()) {
                state.processed_ids.push(meta.id);
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Copy entries this store is missing from `remote`, then fold them in.
    pub async fn pull_changes_from(
        &self,
        remote: &dyn ContentAddressedStore,
    ) -> Result<usize, DbError> {
        self.check_peer(remote)?;
        let remote_ids = remote.get_all_ids().await?;
        let present: HashSet<String> = self.store.has_entries(&remote_ids).await?.into_iter().collect();
        let missing: Vec<String> = remote_ids
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        let entries = remote.get_entries(&missing).await?;
        self.store.put_entries(&entries).await?;
        self.sync_store_changes().await?;
        Ok(entries.len())
    }

    /// Copy entries `remote` is missing from this store.
    pub async fn push_changes_to(
        &self,
        remote: &dyn ContentAddressedStore,
    ) -> Result<usize, DbError> {
        self.check_peer(remote)?;
        let local_ids = self.store.get_all_ids().await?;
        let present: HashSet<String> = remote.has_entries(&local_ids).await?.into_iter().collect();
        let missing: Vec<String> = local_ids
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }
        let entries = self.store.get_entries(&missing).await?;
        remote.put_entries(&entries).await?;
        Ok(entries.len())
    }

    /// Incremental pull: walk the remote's ordered metadata scan from
    /// `cursor`, fetch whatever is missing locally, and return the cursor to
    /// resume from next time. Suits peers that sync periodically without
    /// re-exchanging full id lists.
    pub async fn pull_changes_from_cursor(
        &self,
        remote: &dyn ContentAddressedStore,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<(usize, Option<String>), DbError> {
        self.check_peer(remote)?;
        let mut cursor = cursor.map(str::to_string);
        let mut pulled = 0usize;
        loop {
            let page = remote
                .scan_entries_since(cursor.as_deref(), page_size, None)
                .await?;
            let page_ids: Vec<String> = page.entries.iter().map(|m| m.id.clone()).collect();
            let present: HashSet<String> =
                self.store.has_entries(&page_ids).await?.into_iter().collect();
            let missing: Vec<String> = page_ids
                .into_iter()
                .filter(|id| !present.contains(id))
                .collect();
            if !missing.is_empty() {
                let entries = remote.get_entries(&missing).await?;
                self.store.put_entries(&entries).await?;
                pulled += entries.len();
            }
            if page.next_cursor.is_some() {
                cursor = page.next_cursor;
            }
            if !page.has_more {
                break;
            }
        }
        if pulled > 0 {
            self.sync_store_changes().await?;
        }
        Ok((pulled, cursor))
    }

    /// Like [`push_changes_to`], but seeded from the remote's bloom summary
    /// instead of its full id list. Ids the filter definitely lacks transfer
    /// immediately; possible false positives are settled with an exact
    /// membership probe before anything ships.
    pub async fn push_changes_to_with_bloom(
        &self,
        remote: &dyn ContentAddressedStore,
    ) -> Result<usize, DbError> {
        self.check_peer(remote)?;
        let summary = remote.get_id_bloom_summary().await?;
        let local_ids = self.store.get_all_ids().await?;
        let (mut missing, maybe): (Vec<String>, Vec<String>) = local_ids
            .into_iter()
            .partition(|id| !summary.might_contain(id));
        if !maybe.is_empty() {
            let present: HashSet<String> = remote.has_entries(&maybe).await?.into_iter().collect();
            missing.extend(maybe.into_iter().filter(|id| !present.contains(id)));
        }
        if missing.is_empty() {
            return Ok(0);
        }
        let entries = self.store.get_entries(&missing).await?;
        remote.put_entries(&entries).await?;
        Ok(entries.len())
    }

    fn check_peer(&self, remote: &dyn ContentAddressedStore) -> Result<(), DbError> {
        if remote.store_id() != self.store.store_id() {
            return Err(DbError::IncompatibleStore {
                expected: self.store.store_id().to_string(),
                actual: remote.store_id().to_string(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projection
    // -----------------------------------------------------------------------

    async fn ensure_loaded(&self, state: &mut DbState, doc_id: &str) -> Result<(), DbError> {
        if state.docs.contains_key(doc_id) {
            return Ok(());
        }
        let ds = self
            .project_document(doc_id, None)
            .await?
            .filter(|ds| ds.valid_entries > 0)
            .ok_or_else(|| DbError::NotFound(format!("document {}", doc_id)))?;
        index_upsert(&mut state.doc_index, None, doc_id, ds.last_modified, ds.is_deleted);
        state.docs.insert(doc_id.to_string(), ds);
        Ok(())
    }

    /// Rebuild a document from its entries. `None` when the store has no
    /// entries for it (within `at_ms`, if bounded).
    async fn project_document(
        &self,
        doc_id: &str,
        at_ms: Option<i64>,
    ) -> Result<Option<DocState>, DbError> {
        let metas = self.store.find_new_entries_for_doc(&[], doc_id).await?;
        let ids: Vec<String> = metas
            .iter()
            .filter(|m| at_ms.map_or(true, |at| m.created_at <= at))
            .filter(|m| m.entry_type != EntryType::AttachmentChunk)
            .map(|m| m.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(None);
        }
        let mut entries = self.store.get_entries(&ids).await?;
        entries.sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));

        // Newest valid snapshot becomes the base state.
        let mut base: Option<(Box<dyn CrdtDoc>, i64)> = None;
        for entry in entries
            .iter()
            .rev()
            .filter(|e| e.entry_type == EntryType::DocSnapshot)
        {
            if !self.author_accepted(entry).await {
                tracing::warn!(doc_id, entry = %entry.id, "skipping snapshot with invalid signature");
                continue;
            }
            match self.decrypt_entry(entry).and_then(|bytes| self.crdt.load(&bytes)) {
                Ok(doc) => {
                    base = Some((doc, entry.created_at));
                    break;
                }
                Err(e) => {
                    tracing::warn!(doc_id, entry = %entry.id, error = %e, "skipping undecryptable snapshot");
                }
            }
        }

        let (mut doc, snapshot_at) = match base {
            Some((doc, at)) => (doc, Some(at)),
            None => (self.crdt.init(), None),
        };

        let mut ds = DocState {
            created_at: i64::MAX,
            last_modified: 0,
            decryption_key_id: DEFAULT_KEY_ID.to_string(),
            is_deleted: false,
            valid_entries: 0,
            hash_to_entry: HashMap::new(),
            doc: self.crdt.init(), // placeholder, replaced below
        };

        for entry in &entries {
            if !entry.entry_type.is_doc_mutation() && entry.entry_type != EntryType::DocSnapshot {
                continue;
            }
            if !self.author_accepted(entry).await {
                tracing::warn!(doc_id, entry = %entry.id, "skipping entry with invalid or untrusted signature");
                continue;
            }
            if entry.entry_type == EntryType::DocCreate {
                ds.decryption_key_id = entry.decryption_key_id.clone();
            }
            ds.created_at = ds.created_at.min(entry.created_at);
            ds.last_modified = ds.last_modified.max(entry.created_at);
            ds.valid_entries += 1;

            if entry.entry_type == EntryType::DocSnapshot {
                continue;
            }
            // Entries already folded into the snapshot are not re-applied.
            let superseded = snapshot_at.map_or(false, |at| entry.created_at <= at);

            if entry.entry_type == EntryType::DocDelete {
                ds.is_deleted = true;
            }
            match self.decrypt_entry(entry) {
                Ok(bytes) => {
                    if let Ok(info) = self.crdt.decode_change(&bytes) {
                        ds.hash_to_entry.insert(info.hash, entry.id.clone());
                    }
                    if !superseded {
                        if let Err(e) = doc.apply(&bytes) {
                            tracing::warn!(doc_id, entry = %entry.id, error = %e, "skipping unappliable change");
                        }
                    }
                }
                Err(e) => {
                    // A lost or revoked key must not take the whole document
                    // down; surviving entries still project.
                    tracing::warn!(doc_id, entry = %entry.id, error = %e, "skipping undecryptable entry");
                    if entry.entry_type != EntryType::DocDelete {
                        ds.valid_entries -= 1;
                    }
                }
            }
        }
        if ds.valid_entries == 0 {
            return Ok(None);
        }
        ds.doc = doc;
        Ok(Some(ds))
    }

    /// Signature over the ciphertext must verify, and the author must be
    /// the admin or (in normal databases) directory-trusted.
    async fn author_accepted(&self, entry: &StoreEntry) -> bool {
        let Ok(author) = sign::verifying_key_from_pem(&entry.created_by_public_key) else {
            return false;
        };
        if !sign::verify_ok(&author, &entry.encrypted_data, &entry.signature) {
            return false;
        }
        if author == self.admin_key {
            return true;
        }
        if self.admin_only {
            return false;
        }
        self.trust
            .validate_public_signing_key(&entry.created_by_public_key)
            .await
    }

    fn decrypt_entry(&self, entry: &StoreEntry) -> Result<Vec<u8>, DbError> {
        let key = self.resolve_key(&entry.decryption_key_id)?;
        Ok(aead::open_payload(&key, &entry.encrypted_data)?)
    }

    fn resolve_key(&self, key_id: &str) -> Result<[u8; KEY_BYTES], DbError> {
        let found = if key_id == DEFAULT_KEY_ID {
            self.keys.get(KeyKind::Tenant, &self.tenant_id)
        } else {
            self.keys.get(KeyKind::Doc, key_id)
        };
        found.ok_or_else(|| DbError::KeyNotFound(key_id.to_string()))
    }

    /// Admin-only databases accept writes only under the admin signing key.
    fn check_write_key(&self, signing_key: &SigningKey) -> Result<(), DbError> {
        if self.admin_only && signing_key.verifying_key() != self.admin_key {
            return Err(DbError::AdminOnly);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sorted index maintenance
// ---------------------------------------------------------------------------

fn index_key(index: &[(i64, String, bool)], last_modified: i64, doc_id: &str) -> Result<usize, usize> {
    index.binary_search_by(|(lm, id, _)| (*lm, id.as_str()).cmp(&(last_modified, doc_id)))
}

fn index_remove(index: &mut Vec<(i64, String, bool)>, last_modified: i64, doc_id: &str) {
    if let Ok(pos) = index_key(index, last_modified, doc_id) {
        index.remove(pos);
    }
}

fn index_upsert(
    index: &mut Vec<(i64, String, bool)>,
    old_modified: Option<i64>,
    doc_id: &str,
    last_modified: i64,
    is_deleted: bool,
) {
    if let Some(old) = old_modified {
        index_remove(index, old, doc_id);
    }
    match index_key(index, last_modified, doc_id) {
        Ok(pos) => index[pos] = (last_modified, doc_id.to_string(), is_deleted),
        Err(pos) => index.insert(pos, (last_modified, doc_id.to_string(), is_deleted)),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
