//! Tenant creation, opening, and on-disk session files.

use std::path::Path;
use std::sync::Arc;

use crate::directory::sign_user_publics;
use crate::error::DbError;
use crate::identity::{PrivateUserIdentity, TenantIdentity};
use crate::keybag::KeyBag;
use crate::tenant::{Tenant, TenantConfig, PUBLIC_INFOS_KEY_ID};

pub const TENANT_FILE: &str = "tenant.json";
pub const USER_FILE: &str = "user.json";
pub const KEYBAG_FILE: &str = "keybag.bin";

/// Result of creating a tenant: the open admin session and the admin's
/// private identity (to be stored by the caller).
pub struct CreatedTenant {
    pub tenant: Arc<Tenant>,
    pub admin: PrivateUserIdentity,
}

/// Create a fresh tenant: admin identity, tenant key, public-infos key,
/// and the admin's own directory registration.
pub async fn create_tenant(
    tenant_id: &str,
    admin_username: &str,
    admin_password: &str,
    config: TenantConfig,
) -> Result<CreatedTenant, DbError> {
    let mut admin = PrivateUserIdentity::create(admin_username, admin_password)?;

    let keys = KeyBag::new();
    keys.create_tenant_key(tenant_id)?;
    keys.create_doc_key(PUBLIC_INFOS_KEY_ID)?;

    let identity = TenantIdentity {
        tenant_id: tenant_id.to_string(),
        admin_signing_public_key_pem: admin.public.signing_public_key_pem.clone(),
        admin_encryption_public_key_pem: admin.public.encryption_public_key_pem.clone(),
    };

    let admin_signing_key = admin.decrypt_signing_key(admin_password)?;
    admin.public.admin_signature = Some(sign_user_publics(&admin_signing_key, &admin.public));

    let tenant = Tenant::open(identity, admin.clone(), admin_password, keys, config)?;
    tenant
        .directory()
        .await?
        .register_user(&admin.public, &admin_signing_key)
        .await?;

    Ok(CreatedTenant { tenant, admin })
}

/// Open an existing tenant for a user whose key bag already holds the
/// tenant key.
pub fn open_tenant(
    identity: TenantIdentity,
    user: PrivateUserIdentity,
    password: &str,
    keys: KeyBag,
    config: TenantConfig,
) -> Result<Arc<Tenant>, DbError> {
    Tenant::open(identity, user, password, keys, config)
}

/// Write a tenant session to `dir`: the tenant identity, the user's private
/// identity, and the key bag sealed to the user's RSA key. The password is
/// needed once to unlock that key; it is never stored.
pub fn persist_tenant_files(
    dir: &Path,
    tenant: &Tenant,
    user: &PrivateUserIdentity,
    password: &str,
) -> Result<(), DbError> {
    std::fs::create_dir_all(dir).map_err(io_err)?;
    write_json(&dir.join(TENANT_FILE), tenant.identity())?;
    write_json(&dir.join(USER_FILE), user)?;
    let encryption_key = user.decrypt_encryption_key(password)?;
    tenant.keys().save_to(&dir.join(KEYBAG_FILE), &encryption_key)
}

/// Open a tenant session previously written with [`persist_tenant_files`].
pub fn open_tenant_from_dir(
    dir: &Path,
    password: &str,
    config: TenantConfig,
) -> Result<Arc<Tenant>, DbError> {
    let identity: TenantIdentity = read_json(&dir.join(TENANT_FILE))?;
    let user: PrivateUserIdentity = read_json(&dir.join(USER_FILE))?;
    let encryption_key = user.decrypt_encryption_key(password)?;
    let keys = KeyBag::load_from(&dir.join(KEYBAG_FILE), &encryption_key)?;
    Tenant::open(identity, user, password, keys, config)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), DbError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| DbError::InvalidInput(format!("serialize {}: {}", path.display(), e)))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DbError> {
    let data = std::fs::read_to_string(path).map_err(io_err)?;
    serde_json::from_str(&data)
        .map_err(|e| DbError::InvalidInput(format!("parse {}: {}", path.display(), e)))
}

fn io_err(e: std::io::Error) -> DbError {
    DbError::Store(mindoo_store::StoreError::Io(e.to_string()))
}
