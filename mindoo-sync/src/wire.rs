//! Wire types for the REST protocol.
//!
//! JSON throughout; binary fields cross as padded base64 strings and
//! timestamps as ms since epoch.

use mindoo_crypto::{b64, envelope, RsaPrivateKey, RsaPublicKey};
use mindoo_store::{
    BloomSummary, CompactionStatus, EntryType, ResolveOptions, ScanFilters, StoreEntry,
    StoreEntryMetadata,
};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub challenge: String,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSyncCapabilities {
    pub protocol_version: String,
    pub cursor_scan: bool,
    pub bloom: bool,
    pub compaction_status: bool,
}

impl NetworkSyncCapabilities {
    /// What a server without a capabilities endpoint is assumed to speak.
    pub fn legacy() -> Self {
        Self {
            protocol_version: "sync-v1".into(),
            cursor_scan: false,
            bloom: false,
            compaction_status: false,
        }
    }

    pub fn current() -> Self {
        Self {
            protocol_version: "sync-v2".into(),
            cursor_scan: true,
            bloom: true,
            compaction_status: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub capabilities: NetworkSyncCapabilities,
}

// ---------------------------------------------------------------------------
// Data plane
// ---------------------------------------------------------------------------

/// Tenant/database scope every data-plane request carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub tenant_id: String,
    pub db_id: String,
}

/// Request carrying nothing but the scope (bloom summary, compaction
/// status).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopedRequest {
    #[serde(flatten)]
    pub scope: Scope,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNewEntriesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub have_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNewEntriesForDocRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub have_ids: Vec<String>,
    pub doc_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindEntriesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date_until: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntriesSinceRequest {
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<ScanFilters>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntriesSinceResponse {
    pub entries: Vec<StoreEntryMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryMetadataResponse {
    pub entries: Vec<StoreEntryMetadata>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomSummaryResponse {
    pub summary: BloomSummary,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionStatusResponse {
    pub status: CompactionStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEntriesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<NetworkEncryptedEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEntriesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub entries: Vec<StoreEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasEntriesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdsResponse {
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDependenciesRequest {
    #[serde(flatten)]
    pub scope: Scope,
    pub start_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ResolveOptions>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Network-encrypted entries
// ---------------------------------------------------------------------------

/// A store entry whose ciphertext is wrapped a second time to the caller's
/// RSA key. Hides entry contents from passive intermediaries even when the
/// symmetric key is already shared.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEncryptedEntry {
    #[serde(flatten)]
    pub meta: StoreEntryMetadata,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    #[serde(with = "b64")]
    pub rsa_encrypted_payload: Vec<u8>,
}

impl NetworkEncryptedEntry {
    /// Server side: wrap an entry's ciphertext to `recipient`.
    pub fn wrap(entry: &StoreEntry, recipient: &RsaPublicKey) -> Result<Self, SyncError> {
        let rsa_encrypted_payload = envelope::rsa_seal(recipient, &entry.encrypted_data)
            .map_err(|e| SyncError::Server(format!("wrap entry: {}", e)))?;
        Ok(Self {
            meta: entry.metadata(),
            signature: entry.signature.clone(),
            rsa_encrypted_payload,
        })
    }

    /// Client side: unwrap with the private RSA key and reassemble the
    /// original entry.
    pub fn unwrap(self, key: &RsaPrivateKey) -> Result<StoreEntry, SyncError> {
        let encrypted_data = envelope::rsa_open(key, &self.rsa_encrypted_payload)
            .map_err(|_| SyncError::InvalidInput("undecryptable network payload".into()))?;
        Ok(StoreEntry {
            entry_type: self.meta.entry_type,
            id: self.meta.id,
            content_hash: self.meta.content_hash,
            doc_id: self.meta.doc_id,
            dependency_ids: self.meta.dependency_ids,
            created_at: self.meta.created_at,
            created_by_public_key: self.meta.created_by_public_key,
            decryption_key_id: self.meta.decryption_key_id,
            signature: self.signature,
            original_size: self.meta.original_size,
            encrypted_size: self.meta.encrypted_size,
            encrypted_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindoo_store::idcodec;

    #[test]
    fn test_network_entry_wrap_unwrap() {
        let data = b"sealed entry bytes".to_vec();
        let entry = StoreEntry {
            entry_type: EntryType::DocChange,
            id: format!("{}_d_0_ab", idcodec::new_uuid7()),
            content_hash: idcodec::content_hash(&data),
            doc_id: idcodec::new_uuid7().to_string(),
            dependency_ids: vec![],
            created_at: 42,
            created_by_public_key: "pem".into(),
            decryption_key_id: "default".into(),
            signature: vec![9u8; 64],
            original_size: 5,
            encrypted_size: data.len() as u64,
            encrypted_data: data,
        };

        let (private, public) = envelope::generate_encryption_keypair().unwrap();
        let wrapped = NetworkEncryptedEntry::wrap(&entry, &public).unwrap();
        assert_ne!(wrapped.rsa_encrypted_payload, entry.encrypted_data);

        let json = serde_json::to_string(&wrapped).unwrap();
        let over_wire: NetworkEncryptedEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(over_wire.unwrap(&private).unwrap(), entry);
    }

    #[test]
    fn test_capabilities_defaults() {
        let legacy = NetworkSyncCapabilities::legacy();
        assert_eq!(legacy.protocol_version, "sync-v1");
        assert!(!legacy.cursor_scan && !legacy.bloom && !legacy.compaction_status);
        let current = NetworkSyncCapabilities::current();
        assert!(current.cursor_scan && current.bloom && current.compaction_status);
    }
}
