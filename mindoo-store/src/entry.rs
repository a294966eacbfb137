//! Core entry model: EntryType, StoreEntry, StoreEntryMetadata.

use mindoo_crypto::b64;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;
use crate::idcodec;

// ---------------------------------------------------------------------------
// Entry type
// ---------------------------------------------------------------------------

/// What kind of record an entry carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    DocCreate,
    DocChange,
    DocSnapshot,
    DocDelete,
    AttachmentChunk,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::DocCreate => "doc_create",
            EntryType::DocChange => "doc_change",
            EntryType::DocSnapshot => "doc_snapshot",
            EntryType::DocDelete => "doc_delete",
            EntryType::AttachmentChunk => "attachment_chunk",
        }
    }

    /// Whether this entry type feeds the CRDT projection of a document.
    pub fn is_doc_mutation(&self) -> bool {
        matches!(
            self,
            EntryType::DocCreate | EntryType::DocChange | EntryType::DocDelete
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StoreEntry
// ---------------------------------------------------------------------------

/// The atomic unit of the store: one signed, encrypted, content-addressed
/// record. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntry {
    pub entry_type: EntryType,
    /// Structured id, see the id codec grammar.
    pub id: String,
    /// Lowercase hex SHA-256 of `encrypted_data`.
    pub content_hash: String,
    /// UUIDv7 of the owning document.
    pub doc_id: String,
    /// Ids of entries this one depends on (resolved from CRDT parent hashes).
    pub dependency_ids: Vec<String>,
    /// Creation time, ms since epoch.
    pub created_at: i64,
    /// PEM Ed25519 public key of the author.
    pub created_by_public_key: String,
    /// `"default"` (tenant key) or a named-key id.
    pub decryption_key_id: String,
    /// Ed25519 signature over `encrypted_data`.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub original_size: u64,
    pub encrypted_size: u64,
    /// AES-256-GCM ciphertext, `iv || ct || tag` layout.
    #[serde(with = "b64")]
    pub encrypted_data: Vec<u8>,
}

impl StoreEntry {
    /// Cheap metadata projection (drops the ciphertext).
    pub fn metadata(&self) -> StoreEntryMetadata {
        StoreEntryMetadata {
            entry_type: self.entry_type,
            id: self.id.clone(),
            content_hash: self.content_hash.clone(),
            doc_id: self.doc_id.clone(),
            dependency_ids: self.dependency_ids.clone(),
            created_at: self.created_at,
            created_by_public_key: self.created_by_public_key.clone(),
            decryption_key_id: self.decryption_key_id.clone(),
            original_size: self.original_size,
            encrypted_size: self.encrypted_size,
        }
    }

    /// Validate the entry's structural invariants before it is accepted.
    ///
    /// Checks the content hash against the ciphertext and the shape of the
    /// id and dependency ids. Signature and trust checks happen in the
    /// document layer, which knows the directory.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.content_hash != idcodec::content_hash(&self.encrypted_data) {
            return Err(StoreError::CorruptEntry(self.id.clone()));
        }
        if !idcodec::is_well_formed_entry_id(&self.id) {
            return Err(StoreError::MalformedEntry(format!("bad id: {}", self.id)));
        }
        for dep in &self.dependency_ids {
            if !idcodec::is_well_formed_entry_id(dep) {
                return Err(StoreError::MalformedEntry(format!(
                    "bad dependency id {} in {}",
                    dep, self.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StoreEntryMetadata
// ---------------------------------------------------------------------------

/// Everything about an entry except its ciphertext. This is what discovery
/// calls ship around.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntryMetadata {
    pub entry_type: EntryType,
    pub id: String,
    pub content_hash: String,
    pub doc_id: String,
    pub dependency_ids: Vec<String>,
    pub created_at: i64,
    pub created_by_public_key: String,
    pub decryption_key_id: String,
    pub original_size: u64,
    pub encrypted_size: u64,
}

impl StoreEntryMetadata {
    /// The `(createdAt, id)` scan key.
    pub fn scan_key(&self) -> (i64, String) {
        (self.created_at, self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> StoreEntry {
        let data = vec![1u8, 2, 3, 4];
        StoreEntry {
            entry_type: EntryType::DocChange,
            id: "019305a7-1111-7abc-8def-0123456789ab_d_0_cafe".into(),
            content_hash: idcodec::content_hash(&data),
            doc_id: "019305a7-1111-7abc-8def-0123456789ab".into(),
            dependency_ids: vec![],
            created_at: 1_700_000_000_000,
            created_by_public_key: "-----BEGIN PUBLIC KEY-----\n".into(),
            decryption_key_id: "default".into(),
            signature: vec![0u8; 64],
            original_size: 4,
            encrypted_size: 4,
            encrypted_data: data,
        }
    }

    #[test]
    fn test_validate_accepts_good_entry() {
        assert!(sample_entry().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_hash_mismatch() {
        let mut e = sample_entry();
        e.content_hash = "deadbeef".into();
        assert!(matches!(e.validate(), Err(StoreError::CorruptEntry(_))));
    }

    #[test]
    fn test_validate_rejects_malformed_dep() {
        let mut e = sample_entry();
        e.dependency_ids = vec!["not-an-entry-id".into()];
        assert!(matches!(e.validate(), Err(StoreError::MalformedEntry(_))));
    }

    #[test]
    fn test_entry_type_wire_spelling() {
        assert_eq!(
            serde_json::to_string(&EntryType::AttachmentChunk).unwrap(),
            "\"attachment_chunk\""
        );
        assert_eq!(EntryType::DocCreate.as_str(), "doc_create");
    }

    #[test]
    fn test_json_base64_fields() {
        let e = sample_entry();
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["encryptedData"], "AQIDBA==");
        let back: StoreEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
