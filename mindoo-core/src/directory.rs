//! Directory: the admin-only root of trust.
//!
//! A normal database tagged admin-only whose documents are admin-signed
//! grant/revoke records. Every other database filters incoming entries by
//! asking the directory whether the author's signing key is currently
//! trusted. The trusted-key cache is invalidated whenever the directory
//! observes a change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use mindoo_crypto::{b64, sign, SigningKey, VerifyingKey};
use tokio::sync::RwLock;

use crate::engine::{Database, TrustResolver};
use crate::error::DbError;
use crate::identity::PublicUserIdentity;
use crate::payload::DocumentData;

pub const DIRECTORY_DB_ID: &str = "directory";

const FORM_USER_ACCESS: &str = "userAccess";
const TYPE_GRANT: &str = "grantAccess";
const TYPE_REVOKE: &str = "revokeAccess";

// ---------------------------------------------------------------------------
// Signed-field enumeration
// ---------------------------------------------------------------------------

// The admin signature inside a record covers exactly these enumerated
// fields; verification rebuilds the same byte string.

fn grant_signed_payload(username: &str, signing_pem: &str, encryption_pem: &str) -> Vec<u8> {
    format!("{}\n{}\n{}\n{}", TYPE_GRANT, username, signing_pem, encryption_pem).into_bytes()
}

fn revoke_signed_payload(username: &str, revoke_doc_id: &str) -> Vec<u8> {
    format!("{}\n{}\n{}", TYPE_REVOKE, username, revoke_doc_id).into_bytes()
}

/// Admin signature over a user's enumerated public fields — the signature a
/// grant record carries and a registered identity keeps.
pub fn sign_user_publics(admin_signing_key: &SigningKey, user: &PublicUserIdentity) -> Vec<u8> {
    sign::sign(
        admin_signing_key,
        &grant_signed_payload(
            &user.username,
            &user.signing_public_key_pem,
            &user.encryption_public_key_pem,
        ),
    )
}

// ---------------------------------------------------------------------------
// Trust cache
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct TrustedUser {
    username: String,
    signing_pem: String,
    encryption_pem: String,
}

struct TrustCache {
    generation: u64,
    /// Raw Ed25519 public key bytes → trusted user.
    by_key: HashMap<[u8; 32], TrustedUser>,
    by_username: HashMap<String, TrustedUser>,
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub struct Directory {
    db: Arc<Database>,
    admin_key: VerifyingKey,
    cache: RwLock<Option<TrustCache>>,
}

impl Directory {
    pub fn new(db: Arc<Database>, admin_key: VerifyingKey) -> Self {
        Self {
            db,
            admin_key,
            cache: RwLock::new(None),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Emit an admin-signed `grantAccess` record for `user`. Returns the
    /// grant document id.
    pub async fn register_user(
        &self,
        user: &PublicUserIdentity,
        admin_signing_key: &SigningKey,
    ) -> Result<String, DbError> {
        if admin_signing_key.verifying_key() != self.admin_key {
            return Err(DbError::AdminOnly);
        }
        let payload = grant_signed_payload(
            &user.username,
            &user.signing_public_key_pem,
            &user.encryption_public_key_pem,
        );
        let signature = sign::sign(admin_signing_key, &payload);

        let mut data = DocumentData::new();
        data.set("form", FORM_USER_ACCESS);
        data.set("type", TYPE_GRANT);
        data.set("username", user.username.clone());
        data.set("signingPublicKey", user.signing_public_key_pem.clone());
        data.set("encryptionPublicKey", user.encryption_public_key_pem.clone());
        data.set("adminSignature", b64::encode(&signature));
        self.db
            .create_document_with_signing_key(data, admin_signing_key)
            .await
    }

    /// Emit one `revokeAccess` record per currently-valid grant for
    /// `username`. Returns the revoked grant document ids.
    pub async fn revoke_user(
        &self,
        username: &str,
        request_data_wipe: bool,
        admin_signing_key: &SigningKey,
    ) -> Result<Vec<String>, DbError> {
        if admin_signing_key.verifying_key() != self.admin_key {
            return Err(DbError::AdminOnly);
        }
        let records = self.scan_records().await?;
        let grants: Vec<&GrantRecord> = records
            .grants
            .iter()
            .filter(|g| g.username == username && !records.revoked.contains(&g.doc_id))
            .collect();
        if grants.is_empty() {
            return Err(DbError::UserNotFound(username.to_string()));
        }

        let mut revoked = Vec::new();
        for grant in grants {
            let payload = revoke_signed_payload(username, &grant.doc_id);
            let signature = sign::sign(admin_signing_key, &payload);

            let mut data = DocumentData::new();
            data.set("form", FORM_USER_ACCESS);
            data.set("type", TYPE_REVOKE);
            data.set("username", username);
            data.set("revokeDocId", grant.doc_id.clone());
            data.set("requestDataWipe", request_data_wipe);
            data.set("adminSignature", b64::encode(&signature));
            self.db
                .create_document_with_signing_key(data, admin_signing_key)
                .await?;
            revoked.push(grant.doc_id.clone());
        }
        Ok(revoked)
    }

    /// Current trusted identity for `username`, if any.
    pub async fn get_user_public_keys(
        &self,
        username: &str,
    ) -> Result<Option<PublicUserIdentity>, DbError> {
        self.refresh_cache().await?;
        let cache = self.cache.read().await;
        Ok(cache
            .as_ref()
            .and_then(|c| c.by_username.get(username))
            .map(|u| PublicUserIdentity {
                username: u.username.clone(),
                admin_signature: None,
                signing_public_key_pem: u.signing_pem.clone(),
                encryption_public_key_pem: u.encryption_pem.clone(),
            }))
    }

    /// Is `pem` the admin key, or the signing key of a currently-unrevoked
    /// registered user?
    pub async fn is_trusted_signing_key(&self, pem: &str) -> Result<bool, DbError> {
        let Ok(key) = sign::verifying_key_from_pem(pem) else {
            return Ok(false);
        };
        if key == self.admin_key {
            return Ok(true);
        }
        self.refresh_cache().await?;
        let cache = self.cache.read().await;
        Ok(cache
            .as_ref()
            .map_or(false, |c| c.by_key.contains_key(key.as_bytes())))
    }

    // -----------------------------------------------------------------------
    // Cache maintenance
    // -----------------------------------------------------------------------

    async fn refresh_cache(&self) -> Result<(), DbError> {
        self.db.sync_store_changes().await?;
        let generation = self.db.change_generation();
        {
            let cache = self.cache.read().await;
            if cache.as_ref().map_or(false, |c| c.generation == generation) {
                return Ok(());
            }
        }

        let records = self.scan_records().await?;
        let mut by_key = HashMap::new();
        let mut by_username = HashMap::new();
        for grant in &records.grants {
            if records.revoked.contains(&grant.doc_id) {
                continue;
            }
            let Ok(key) = sign::verifying_key_from_pem(&grant.signing_pem) else {
                tracing::warn!(doc = %grant.doc_id, "grant carries unparseable signing key");
                continue;
            };
            let user = TrustedUser {
                username: grant.username.clone(),
                signing_pem: grant.signing_pem.clone(),
                encryption_pem: grant.encryption_pem.clone(),
            };
            by_key.insert(*key.as_bytes(), user.clone());
            by_username.insert(grant.username.clone(), user);
        }

        *self.cache.write().await = Some(TrustCache {
            generation,
            by_key,
            by_username,
        });
        Ok(())
    }

    /// Walk all directory documents and collect verified grant/revoke
    /// records. Records whose admin signature does not verify are dropped.
    async fn scan_records(&self) -> Result<DirectoryRecords, DbError> {
        let mut records = DirectoryRecords::default();
        for doc_id in self.db.get_all_document_ids().await? {
            let data = match self.db.get_document(&doc_id).await {
                Ok(data) => data,
                Err(DbError::DocumentDeleted(_)) => continue,
                Err(e) => return Err(e),
            };
            if data.get_str("form") != Some(FORM_USER_ACCESS) {
                continue;
            }
            match data.get_str("type") {
                Some(TYPE_GRANT) => {
                    let (Some(username), Some(signing), Some(encryption), Some(sig)) = (
                        data.get_str("username"),
                        data.get_str("signingPublicKey"),
                        data.get_str("encryptionPublicKey"),
                        data.get_str("adminSignature"),
                    ) else {
                        tracing::warn!(doc = %doc_id, "malformed grant record");
                        continue;
                    };
                    if !self.admin_signed(&grant_signed_payload(username, signing, encryption), sig)
                    {
                        tracing::warn!(doc = %doc_id, "grant record fails admin signature check");
                        continue;
                    }
                    records.grants.push(GrantRecord {
                        doc_id: doc_id.clone(),
                        username: username.to_string(),
                        signing_pem: signing.to_string(),
                        encryption_pem: encryption.to_string(),
                    });
                }
                Some(TYPE_REVOKE) => {
                    let (Some(username), Some(revoke_doc_id), Some(sig)) = (
                        data.get_str("username"),
                        data.get_str("revokeDocId"),
                        data.get_str("adminSignature"),
                    ) else {
                        tracing::warn!(doc = %doc_id, "malformed revoke record");
                        continue;
                    };
                    if !self.admin_signed(&revoke_signed_payload(username, revoke_doc_id), sig) {
                        tracing::warn!(doc = %doc_id, "revoke record fails admin signature check");
                        continue;
                    }
                    records.revoked.insert(revoke_doc_id.to_string());
                }
                _ => {}
            }
        }
        Ok(records)
    }

    fn admin_signed(&self, payload: &[u8], signature_b64: &str) -> bool {
        let Ok(signature) = b64::decode(signature_b64) else {
            return false;
        };
        sign::verify_ok(&self.admin_key, payload, &signature)
    }
}

#[derive(Default)]
struct DirectoryRecords {
    grants: Vec<GrantRecord>,
    revoked: HashSet<String>,
}

struct GrantRecord {
    doc_id: String,
    username: String,
    signing_pem: String,
    encryption_pem: String,
}

#[async_trait]
impl TrustResolver for Directory {
    async fn validate_public_signing_key(&self, pem: &str) -> bool {
        match self.is_trusted_signing_key(pem).await {
            Ok(trusted) => trusted,
            Err(e) => {
                tracing::warn!(error = %e, "trust lookup failed; treating key as untrusted");
                false
            }
        }
    }
}
