//! Password wrapping of secrets: PBKDF2-SHA256 → AES-256-GCM.
//!
//! The wrapper struct separates `(ciphertext, iv, tag, salt, iterations)`,
//! unlike the inline `iv || ct || tag` payload layout. It is used uniformly
//! for symmetric keys and for both halves of a user keypair.

use serde::{Deserialize, Serialize};

use crate::aead::{self, NONCE_BYTES, TAG_BYTES};
use crate::b64;
use crate::error::CryptoError;
use crate::kdf::{self, SALT_BYTES};

/// A password-wrapped secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKey {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    /// Creation time, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

/// Wrap `secret` under `password` with the default iteration count.
pub fn wrap_secret(password: &str, secret: &[u8]) -> Result<EncryptedKey, CryptoError> {
    wrap_secret_with_iterations(password, secret, kdf::DEFAULT_ITERATIONS)
}

pub fn wrap_secret_with_iterations(
    password: &str,
    secret: &[u8],
    iterations: u32,
) -> Result<EncryptedKey, CryptoError> {
    if iterations < kdf::MIN_ITERATIONS {
        return Err(CryptoError::Encrypt);
    }
    let salt = kdf::salt()?;
    let key = kdf::derive_key(password, &salt, iterations);
    let iv = aead::nonce()?;
    let ct_and_tag = aead::aead_seal(&key, &iv, secret)?;

    let split = ct_and_tag.len() - TAG_BYTES;
    Ok(EncryptedKey {
        ciphertext: ct_and_tag[..split].to_vec(),
        tag: ct_and_tag[split..].to_vec(),
        iv: iv.to_vec(),
        salt: salt.to_vec(),
        iterations,
        created_at: None,
    })
}

/// Unwrap a secret. Fails uniformly on a wrong password, tampered fields or
/// an iteration count below the floor.
pub fn unwrap_secret(password: &str, wrapped: &EncryptedKey) -> Result<Vec<u8>, CryptoError> {
    if wrapped.iterations < kdf::MIN_ITERATIONS {
        return Err(CryptoError::Decrypt);
    }
    let salt: [u8; SALT_BYTES] = wrapped
        .salt
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Decrypt)?;
    let iv: [u8; NONCE_BYTES] = wrapped
        .iv
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Decrypt)?;
    if wrapped.tag.len() != TAG_BYTES {
        return Err(CryptoError::Decrypt);
    }

    let key = kdf::derive_key(password, &salt, wrapped.iterations);
    let mut ct_and_tag = Vec::with_capacity(wrapped.ciphertext.len() + TAG_BYTES);
    ct_and_tag.extend_from_slice(&wrapped.ciphertext);
    ct_and_tag.extend_from_slice(&wrapped.tag);
    aead::aead_open(&key, &iv, &ct_and_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapped = wrap_secret("hunter2", b"raw key material").unwrap();
        assert_eq!(wrapped.iv.len(), NONCE_BYTES);
        assert_eq!(wrapped.tag.len(), TAG_BYTES);
        assert_eq!(wrapped.salt.len(), SALT_BYTES);
        assert_eq!(unwrap_secret("hunter2", &wrapped).unwrap(), b"raw key material");
    }

    #[test]
    fn test_wrong_password_fails() {
        let wrapped = wrap_secret("hunter2", b"secret").unwrap();
        assert_eq!(unwrap_secret("hunter3", &wrapped), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_low_iteration_count_rejected() {
        assert_eq!(
            wrap_secret_with_iterations("pw", b"x", 1_000),
            Err(CryptoError::Encrypt)
        );
        let mut wrapped = wrap_secret("pw", b"x").unwrap();
        wrapped.iterations = 50_000;
        assert_eq!(unwrap_secret("pw", &wrapped), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let mut wrapped = wrap_secret("pw", b"secret").unwrap();
        wrapped.tag[0] ^= 0x01;
        assert_eq!(unwrap_secret("pw", &wrapped), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_json_roundtrip() {
        let wrapped = wrap_secret("pw", b"secret").unwrap();
        let json = serde_json::to_string(&wrapped).unwrap();
        let restored: EncryptedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(unwrap_secret("pw", &restored).unwrap(), b"secret");
    }
}
