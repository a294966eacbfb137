//! KeyBag: the symmetric keys the local user currently holds.
//!
//! Keys are indexed by `(kind, id)`. Reads are cheap (keys are immutable
//! once placed); mutations take the writer lock. At rest the whole map is
//! one AES-GCM blob sealed under a key derived from the owner's RSA private
//! key, so only the owning user can open it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::Utc;

use mindoo_crypto::aead::{self, KEY_BYTES};
use mindoo_crypto::{b64, envelope, wrap, EncryptedKey, RsaPrivateKey};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Reserved id targeting the tenant key.
pub const DEFAULT_KEY_ID: &str = "default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Doc,
    Tenant,
}

#[derive(Clone, Copy)]
struct KeyRecord {
    raw: [u8; KEY_BYTES],
    created_at: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedKey {
    kind: KeyKind,
    id: String,
    #[serde(with = "b64")]
    raw: Vec<u8>,
    created_at: i64,
}

#[derive(Default)]
pub struct KeyBag {
    keys: RwLock<HashMap<(KeyKind, String), KeyRecord>>,
}

impl KeyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: KeyKind, id: impl Into<String>, raw: [u8; KEY_BYTES]) {
        self.set_with_created_at(kind, id, raw, now_ms());
    }

    pub fn set_with_created_at(
        &self,
        kind: KeyKind,
        id: impl Into<String>,
        raw: [u8; KEY_BYTES],
        created_at: i64,
    ) {
        self.keys
            .write()
            .expect("lock")
            .insert((kind, id.into()), KeyRecord { raw, created_at });
    }

    pub fn get(&self, kind: KeyKind, id: &str) -> Option<[u8; KEY_BYTES]> {
        self.keys
            .read()
            .expect("lock")
            .get(&(kind, id.to_string()))
            .map(|r| r.raw)
    }

    pub fn contains(&self, kind: KeyKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn list_keys(&self) -> Vec<(KeyKind, String)> {
        let mut out: Vec<(KeyKind, String)> = self
            .keys
            .read()
            .expect("lock")
            .keys()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Generate and place a fresh document key.
    pub fn create_doc_key(&self, id: impl Into<String>) -> Result<[u8; KEY_BYTES], DbError> {
        let raw = aead::generate_key()?;
        self.set(KeyKind::Doc, id, raw);
        Ok(raw)
    }

    /// Generate and place a fresh tenant key.
    pub fn create_tenant_key(&self, id: impl Into<String>) -> Result<[u8; KEY_BYTES], DbError> {
        let raw = aead::generate_key()?;
        self.set(KeyKind::Tenant, id, raw);
        Ok(raw)
    }

    /// Unwrap a password-wrapped key and place it under `(doc, id)`.
    pub fn decrypt_and_import_key(
        &self,
        id: impl Into<String>,
        wrapped: &EncryptedKey,
        password: &str,
    ) -> Result<(), DbError> {
        let raw = wrap::unwrap_secret(password, wrapped)?;
        let raw: [u8; KEY_BYTES] = raw
            .as_slice()
            .try_into()
            .map_err(|_| DbError::CryptoFailure(mindoo_crypto::CryptoError::InvalidKey))?;
        self.set(KeyKind::Doc, id, raw);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Seal the whole bag under a key derived from the owner's RSA private
    /// key.
    pub fn to_sealed(&self, owner: &RsaPrivateKey) -> Result<Vec<u8>, DbError> {
        let persisted: Vec<PersistedKey> = {
            let keys = self.keys.read().expect("lock");
            let mut out: Vec<PersistedKey> = keys
                .iter()
                .map(|((kind, id), record)| PersistedKey {
                    kind: *kind,
                    id: id.clone(),
                    raw: record.raw.to_vec(),
                    created_at: record.created_at,
                })
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            out
        };
        let json = serde_json::to_vec(&persisted)
            .map_err(|e| DbError::InvalidInput(format!("serialize key bag: {}", e)))?;
        Ok(aead::seal_payload(&owner_key(owner)?, &json)?)
    }

    /// Open a sealed bag.
    pub fn from_sealed(owner: &RsaPrivateKey, sealed: &[u8]) -> Result<Self, DbError> {
        let json = aead::open_payload(&owner_key(owner)?, sealed)?;
        let persisted: Vec<PersistedKey> = serde_json::from_slice(&json)
            .map_err(|e| DbError::InvalidInput(format!("parse key bag: {}", e)))?;
        let bag = Self::new();
        for key in persisted {
            let raw: [u8; KEY_BYTES] = key
                .raw
                .as_slice()
                .try_into()
                .map_err(|_| DbError::CryptoFailure(mindoo_crypto::CryptoError::InvalidKey))?;
            bag.set_with_created_at(key.kind, key.id, raw, key.created_at);
        }
        Ok(bag)
    }

    pub fn save_to(&self, path: &Path, owner: &RsaPrivateKey) -> Result<(), DbError> {
        let sealed = self.to_sealed(owner)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &sealed).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn load_from(path: &Path, owner: &RsaPrivateKey) -> Result<Self, DbError> {
        let sealed = std::fs::read(path).map_err(io_err)?;
        Self::from_sealed(owner, &sealed)
    }
}

fn owner_key(owner: &RsaPrivateKey) -> Result<[u8; KEY_BYTES], DbError> {
    Ok(envelope::derive_storage_key(owner)?)
}

fn io_err(e: std::io::Error) -> DbError {
    DbError::Store(mindoo_store::StoreError::Io(e.to_string()))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindoo_crypto::envelope;

    #[test]
    fn test_set_get_list() {
        let bag = KeyBag::new();
        let key = bag.create_doc_key("notes").unwrap();
        assert_eq!(bag.get(KeyKind::Doc, "notes"), Some(key));
        assert_eq!(bag.get(KeyKind::Tenant, "notes"), None);
        assert_eq!(bag.list_keys(), vec![(KeyKind::Doc, "notes".into())]);
    }

    #[test]
    fn test_import_wrapped_key() {
        let bag = KeyBag::new();
        let raw = aead::generate_key().unwrap();
        let wrapped = wrap::wrap_secret("share-pw", &raw).unwrap();
        bag.decrypt_and_import_key("shared", &wrapped, "share-pw").unwrap();
        assert_eq!(bag.get(KeyKind::Doc, "shared"), Some(raw));
    }

    #[test]
    fn test_sealed_roundtrip() {
        let (owner, _) = envelope::generate_encryption_keypair().unwrap();
        let bag = KeyBag::new();
        let tenant_key = bag.create_tenant_key("acme").unwrap();
        let doc_key = bag.create_doc_key("notes").unwrap();

        let sealed = bag.to_sealed(&owner).unwrap();
        let restored = KeyBag::from_sealed(&owner, &sealed).unwrap();
        assert_eq!(restored.get(KeyKind::Tenant, "acme"), Some(tenant_key));
        assert_eq!(restored.get(KeyKind::Doc, "notes"), Some(doc_key));
    }

    #[test]
    fn test_sealed_bag_is_owner_bound() {
        let (owner, _) = envelope::generate_encryption_keypair().unwrap();
        let (intruder, _) = envelope::generate_encryption_keypair().unwrap();
        let bag = KeyBag::new();
        bag.create_tenant_key("acme").unwrap();

        let sealed = bag.to_sealed(&owner).unwrap();
        assert!(KeyBag::from_sealed(&intruder, &sealed).is_err());
    }

    #[test]
    fn test_save_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keybag.bin");
        let (owner, _) = envelope::generate_encryption_keypair().unwrap();

        let bag = KeyBag::new();
        let key = bag.create_doc_key("notes").unwrap();
        bag.save_to(&path, &owner).unwrap();

        let restored = KeyBag::load_from(&path, &owner).unwrap();
        assert_eq!(restored.get(KeyKind::Doc, "notes"), Some(key));
    }
}
