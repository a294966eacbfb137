//! AEAD: AES-256-GCM.
//!
//! Payload layout is `iv (12B) || ciphertext || tag (16B)` — the tag stays
//! glued to the ciphertext. The PBKDF2 key-wrapping path in [`crate::wrap`]
//! is the one place that carries the tag in a separate field.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::CryptoError;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;

/// Minimum length of a sealed payload: iv + tag.
pub const MIN_SEALED_BYTES: usize = NONCE_BYTES + TAG_BYTES;

/// Generate a fresh random 256-bit symmetric key.
pub fn generate_key() -> Result<[u8; KEY_BYTES], CryptoError> {
    let mut k = [0u8; KEY_BYTES];
    getrandom(&mut k).map_err(|_| CryptoError::Rng)?;
    Ok(k)
}

/// Generate a random 12-byte nonce. Used during encryption only.
pub fn nonce() -> Result<[u8; NONCE_BYTES], CryptoError> {
    let mut n = [0u8; NONCE_BYTES];
    getrandom(&mut n).map_err(|_| CryptoError::Rng)?;
    Ok(n)
}

/// AEAD seal with an explicit nonce. Returns `ciphertext || tag`.
pub fn aead_seal(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;
    let n = Nonce::from_slice(nonce);
    cipher.encrypt(n, plaintext).map_err(|_| CryptoError::Encrypt)
}

/// AEAD open with an explicit nonce. Expects `ciphertext || tag`.
pub fn aead_open(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    let n = Nonce::from_slice(nonce);
    cipher.decrypt(n, ciphertext).map_err(|_| CryptoError::Decrypt)
}

/// Seal `plaintext` into the standard `iv || ciphertext || tag` layout.
pub fn seal_payload(key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = nonce()?;
    let ct = aead_seal(key, &iv, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_BYTES + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a payload in the standard `iv || ciphertext || tag` layout.
pub fn open_payload(key: &[u8; KEY_BYTES], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < MIN_SEALED_BYTES {
        return Err(CryptoError::Decrypt);
    }
    let iv: [u8; NONCE_BYTES] = sealed[..NONCE_BYTES]
        .try_into()
        .map_err(|_| CryptoError::Decrypt)?;
    aead_open(key, &iv, &sealed[NONCE_BYTES..])
}
