//! Tenant: the per-user session over one tenant's databases.
//!
//! Owns the current user identity, the key bag, the store factory and the
//! cache of open databases, and routes encrypt/decrypt/sign through the
//! right keys. The directory database is always opened admin-only.

use std::collections::HashMap;
use std::sync::Arc;

use mindoo_crypto::{aead, sign, EncryptedKey, SigningKey, VerifyingKey};
use mindoo_store::StoreFactory;
use tokio::sync::{Mutex, OnceCell};

use crate::crdt::CrdtProvider;
use crate::directory::{Directory, DIRECTORY_DB_ID};
use crate::engine::{AdminOnlyTrust, Database, DatabaseParams, TrustResolver};
use crate::error::DbError;
use crate::identity::{CurrentUser, PrivateUserIdentity, TenantIdentity};
use crate::keybag::{KeyBag, KeyKind, DEFAULT_KEY_ID};

/// Named key protecting shareable public-info documents; distributed to
/// every member at join time alongside the tenant key.
pub const PUBLIC_INFOS_KEY_ID: &str = "public-infos";

/// Pluggable backends for a tenant instance.
#[derive(Clone)]
pub struct TenantConfig {
    pub store_factory: Arc<dyn StoreFactory>,
    pub crdt: Arc<dyn CrdtProvider>,
}

pub struct Tenant {
    identity: TenantIdentity,
    user: Arc<CurrentUser>,
    keys: Arc<KeyBag>,
    config: TenantConfig,
    admin_key: VerifyingKey,
    databases: Mutex<HashMap<String, Arc<Database>>>,
    directory: OnceCell<Arc<Directory>>,
}

impl Tenant {
    /// Open a tenant session for `user`. The key bag must already hold the
    /// tenant key (creation and join install it).
    pub fn open(
        identity: TenantIdentity,
        user: PrivateUserIdentity,
        password: &str,
        keys: KeyBag,
        config: TenantConfig,
    ) -> Result<Arc<Self>, DbError> {
        let admin_key = sign::verifying_key_from_pem(&identity.admin_signing_public_key_pem)?;
        if !keys.contains(KeyKind::Tenant, &identity.tenant_id) {
            return Err(DbError::KeyNotFound(identity.tenant_id.clone()));
        }
        Ok(Arc::new(Self {
            identity,
            user: Arc::new(CurrentUser::new(user, password)),
            keys: Arc::new(keys),
            config,
            admin_key,
            databases: Mutex::new(HashMap::new()),
            directory: OnceCell::new(),
        }))
    }

    pub fn tenant_id(&self) -> &str {
        &self.identity.tenant_id
    }

    pub fn identity(&self) -> &TenantIdentity {
        &self.identity
    }

    pub fn current_user(&self) -> &Arc<CurrentUser> {
        &self.user
    }

    pub fn keys(&self) -> &Arc<KeyBag> {
        &self.keys
    }

    pub fn admin_verifying_key(&self) -> &VerifyingKey {
        &self.admin_key
    }

    /// Whether the signed-in user holds the admin signing key.
    pub fn current_user_is_admin(&self) -> Result<bool, DbError> {
        Ok(self.user.signing_key()?.verifying_key() == self.admin_key)
    }

    // -----------------------------------------------------------------------
    // Payload crypto routing
    // -----------------------------------------------------------------------

    pub fn encrypt_payload(&self, bytes: &[u8], key_id: &str) -> Result<Vec<u8>, DbError> {
        Ok(aead::seal_payload(&self.resolve_key(key_id)?, bytes)?)
    }

    pub fn decrypt_payload(&self, sealed: &[u8], key_id: &str) -> Result<Vec<u8>, DbError> {
        Ok(aead::open_payload(&self.resolve_key(key_id)?, sealed)?)
    }

    /// Ed25519 over `bytes` with the current user's (lazily decrypted)
    /// signing key.
    pub fn sign_payload(&self, bytes: &[u8]) -> Result<Vec<u8>, DbError> {
        Ok(sign::sign(self.user.signing_key()?.as_ref(), bytes))
    }

    /// Verify `signature` over `bytes` under `pem`. False when the key is
    /// not currently trusted, regardless of the signature.
    pub async fn verify_signature(
        &self,
        bytes: &[u8],
        signature: &[u8],
        pem: &str,
    ) -> Result<bool, DbError> {
        let Ok(key) = sign::verifying_key_from_pem(pem) else {
            return Ok(false);
        };
        if !sign::verify_ok(&key, bytes, signature) {
            return Ok(false);
        }
        Ok(self.directory().await?.is_trusted_signing_key(pem).await?)
    }

    /// Install a named symmetric key shipped as a password-wrapped blob.
    pub fn add_named_key(
        &self,
        id: &str,
        wrapped: &EncryptedKey,
        password: &str,
    ) -> Result<(), DbError> {
        if id == DEFAULT_KEY_ID {
            return Err(DbError::InvalidInput(format!(
                "key id '{}' is reserved",
                DEFAULT_KEY_ID
            )));
        }
        self.keys.decrypt_and_import_key(id, wrapped, password)
    }

    fn resolve_key(&self, key_id: &str) -> Result<[u8; aead::KEY_BYTES], DbError> {
        let found = if key_id == DEFAULT_KEY_ID {
            self.keys.get(KeyKind::Tenant, &self.identity.tenant_id)
        } else {
            self.keys.get(KeyKind::Doc, key_id)
        };
        found.ok_or_else(|| DbError::KeyNotFound(key_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Database lifecycle
    // -----------------------------------------------------------------------

    /// The directory database, wrapped in its trust service.
    pub async fn directory(&self) -> Result<Arc<Directory>, DbError> {
        self.directory
            .get_or_try_init(|| async {
                let db = self
                    .build_database(DIRECTORY_DB_ID, true, Arc::new(AdminOnlyTrust))
                    .await?;
                Ok(Arc::new(Directory::new(db, self.admin_key)))
            })
            .await
            .map(|directory| directory.clone())
    }

    /// Open (or return the cached) database. `admin_only` is forced on for
    /// the directory regardless of the caller's request.
    pub async fn open_db(&self, db_id: &str) -> Result<Arc<Database>, DbError> {
        self.open_db_with_options(db_id, false).await
    }

    pub async fn open_db_with_options(
        &self,
        db_id: &str,
        admin_only: bool,
    ) -> Result<Arc<Database>, DbError> {
        if db_id == DIRECTORY_DB_ID {
            return Ok(self.directory().await?.database().clone());
        }
        let directory = self.directory().await?;

        let mut databases = self.databases.lock().await;
        if let Some(db) = databases.get(db_id) {
            return Ok(db.clone());
        }
        let db = self.build_database(db_id, admin_only, directory).await?;
        databases.insert(db_id.to_string(), db.clone());
        Ok(db)
    }

    async fn build_database(
        &self,
        db_id: &str,
        admin_only: bool,
        trust: Arc<dyn TrustResolver>,
    ) -> Result<Arc<Database>, DbError> {
        let store = self.config.store_factory.open_store(db_id).await?;
        Ok(Arc::new(Database::new(DatabaseParams {
            db_id: db_id.to_string(),
            tenant_id: self.identity.tenant_id.clone(),
            admin_only,
            store,
            crdt: self.config.crdt.clone(),
            keys: self.keys.clone(),
            user: self.user.clone(),
            admin_key: self.admin_key,
            trust,
        })))
    }
}
