//! Tenant and user identities.
//!
//! The public half of a user travels through join requests and directory
//! records; the private half wraps both private keys under the user's
//! password and never leaves the owning process.

use std::sync::{Arc, RwLock};

use mindoo_crypto::{b64, envelope, sign, wrap, EncryptedKey, RsaPrivateKey, SigningKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::DbError;

// ---------------------------------------------------------------------------
// Tenant identity
// ---------------------------------------------------------------------------

/// Immutable tenant identity. Created once; opened thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantIdentity {
    pub tenant_id: String,
    pub admin_signing_public_key_pem: String,
    pub admin_encryption_public_key_pem: String,
}

// ---------------------------------------------------------------------------
// User identities
// ---------------------------------------------------------------------------

/// The shareable half of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUserIdentity {
    pub username: String,
    /// Admin signature over the enumerated public fields, present once the
    /// user is registered in the directory.
    #[serde(default, with = "b64::opt", skip_serializing_if = "Option::is_none")]
    pub admin_signature: Option<Vec<u8>>,
    pub signing_public_key_pem: String,
    pub encryption_public_key_pem: String,
}

/// A user with password-wrapped private keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateUserIdentity {
    #[serde(flatten)]
    pub public: PublicUserIdentity,
    pub encrypted_signing_key: EncryptedKey,
    pub encrypted_encryption_key: EncryptedKey,
}

impl PrivateUserIdentity {
    /// Create a fresh identity: new Ed25519 and RSA keypairs, both private
    /// halves wrapped under `password`.
    pub fn create(username: impl Into<String>, password: &str) -> Result<Self, DbError> {
        let signing_key = sign::generate_signing_key();
        let (encryption_private, encryption_public) = envelope::generate_encryption_keypair()?;

        let signing_pem = Zeroizing::new(sign::signing_key_to_pem(&signing_key)?);
        let encryption_pem = Zeroizing::new(envelope::encryption_private_key_to_pem(
            &encryption_private,
        )?);

        Ok(Self {
            public: PublicUserIdentity {
                username: username.into(),
                admin_signature: None,
                signing_public_key_pem: sign::verifying_key_to_pem(&signing_key.verifying_key())?,
                encryption_public_key_pem: envelope::encryption_public_key_to_pem(
                    &encryption_public,
                )?,
            },
            encrypted_signing_key: wrap::wrap_secret(password, signing_pem.as_bytes())?,
            encrypted_encryption_key: wrap::wrap_secret(password, encryption_pem.as_bytes())?,
        })
    }

    pub fn username(&self) -> &str {
        &self.public.username
    }

    pub fn decrypt_signing_key(&self, password: &str) -> Result<SigningKey, DbError> {
        let pem = Zeroizing::new(wrap::unwrap_secret(password, &self.encrypted_signing_key)?);
        let pem = std::str::from_utf8(&pem)
            .map_err(|_| DbError::CryptoFailure(mindoo_crypto::CryptoError::InvalidPem))?;
        Ok(sign::signing_key_from_pem(pem)?)
    }

    pub fn decrypt_encryption_key(&self, password: &str) -> Result<RsaPrivateKey, DbError> {
        let pem = Zeroizing::new(wrap::unwrap_secret(
            password,
            &self.encrypted_encryption_key,
        )?);
        let pem = std::str::from_utf8(&pem)
            .map_err(|_| DbError::CryptoFailure(mindoo_crypto::CryptoError::InvalidPem))?;
        Ok(envelope::encryption_private_key_from_pem(pem)?)
    }
}

// ---------------------------------------------------------------------------
// Current user (lazy key cache)
// ---------------------------------------------------------------------------

/// The signed-in user of a tenant instance. Private keys are decrypted on
/// first use and cached immutable from then on.
pub struct CurrentUser {
    identity: PrivateUserIdentity,
    password: Zeroizing<String>,
    signing: RwLock<Option<Arc<SigningKey>>>,
    encryption: RwLock<Option<Arc<RsaPrivateKey>>>,
}

impl CurrentUser {
    pub fn new(identity: PrivateUserIdentity, password: impl Into<String>) -> Self {
        Self {
            identity,
            password: Zeroizing::new(password.into()),
            signing: RwLock::new(None),
            encryption: RwLock::new(None),
        }
    }

    pub fn username(&self) -> &str {
        self.identity.username()
    }

    pub fn public(&self) -> &PublicUserIdentity {
        &self.identity.public
    }

    pub fn signing_public_key_pem(&self) -> &str {
        &self.identity.public.signing_public_key_pem
    }

    /// Lazily decrypted, cached signing key.
    pub fn signing_key(&self) -> Result<Arc<SigningKey>, DbError> {
        if let Some(key) = self.signing.read().expect("lock").as_ref() {
            return Ok(key.clone());
        }
        let key = Arc::new(self.identity.decrypt_signing_key(&self.password)?);
        *self.signing.write().expect("lock") = Some(key.clone());
        Ok(key)
    }

    /// Lazily decrypted, cached RSA private key.
    pub fn encryption_key(&self) -> Result<Arc<RsaPrivateKey>, DbError> {
        if let Some(key) = self.encryption.read().expect("lock").as_ref() {
            return Ok(key.clone());
        }
        let key = Arc::new(self.identity.decrypt_encryption_key(&self.password)?);
        *self.encryption.write().expect("lock") = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_unlock() {
        let user = PrivateUserIdentity::create("alice", "pw").unwrap();
        assert_eq!(user.username(), "alice");
        assert!(user.public.admin_signature.is_none());

        let sk = user.decrypt_signing_key("pw").unwrap();
        let expected = sign::verifying_key_from_pem(&user.public.signing_public_key_pem).unwrap();
        assert_eq!(sk.verifying_key(), expected);

        user.decrypt_encryption_key("pw").unwrap();
    }

    #[test]
    fn test_wrong_password_fails() {
        let user = PrivateUserIdentity::create("alice", "pw").unwrap();
        assert!(user.decrypt_signing_key("wrong").is_err());
        assert!(user.decrypt_encryption_key("wrong").is_err());
    }

    #[test]
    fn test_private_identity_json_roundtrip() {
        let user = PrivateUserIdentity::create("alice", "pw").unwrap();
        let json = serde_json::to_string(&user).unwrap();
        let restored: PrivateUserIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.public, user.public);
        restored.decrypt_signing_key("pw").unwrap();
    }

    #[test]
    fn test_current_user_caches_keys() {
        let identity = PrivateUserIdentity::create("alice", "pw").unwrap();
        let user = CurrentUser::new(identity, "pw");
        let a = user.signing_key().unwrap();
        let b = user.signing_key().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
