//! RSA-OAEP network envelope.
//!
//! RSA-OAEP cannot seal bulk payloads, so the envelope is hybrid: a fresh
//! AES-256 content key seals the payload, RSA-OAEP-SHA256 wraps the content
//! key, and a versioned header precedes both on the wire.
//!
//! Wire format (v1):
//!   version[1] || wrapped_key_len[2 BE] || wrapped_key || iv[12] || ct || tag[16]

use rand_core::OsRng;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::{self, MIN_SEALED_BYTES};
use crate::error::CryptoError;

/// Version byte for v1.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Header size: version + wrapped_key_len(u16).
pub const HEADER_BYTES: usize = 3;

/// RSA modulus size for newly generated encryption keypairs.
pub const RSA_BITS: usize = 2048;

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Generate a fresh RSA encryption keypair.
pub fn generate_encryption_keypair() -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|_| CryptoError::InvalidKey)?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

/// Seal `payload` to `recipient`.
pub fn rsa_seal(recipient: &RsaPublicKey, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let content_key = Zeroizing::new(aead::generate_key()?);
    let sealed = aead::seal_payload(&content_key, payload)?;
    let wrapped = recipient
        .encrypt(&mut OsRng, oaep(), content_key.as_ref())
        .map_err(|_| CryptoError::Encrypt)?;
    if wrapped.len() > u16::MAX as usize {
        return Err(CryptoError::Encrypt);
    }

    let mut out = Vec::with_capacity(HEADER_BYTES + wrapped.len() + sealed.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&(wrapped.len() as u16).to_be_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open an envelope produced by [`rsa_seal`].
pub fn rsa_open(recipient: &RsaPrivateKey, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < HEADER_BYTES {
        return Err(CryptoError::Decrypt);
    }
    if wire[0] != ENVELOPE_VERSION {
        return Err(CryptoError::Decrypt);
    }
    let wrapped_len = u16::from_be_bytes([wire[1], wire[2]]) as usize;
    if wire.len() < HEADER_BYTES + wrapped_len + MIN_SEALED_BYTES {
        return Err(CryptoError::Decrypt);
    }
    let wrapped = &wire[HEADER_BYTES..HEADER_BYTES + wrapped_len];
    let sealed = &wire[HEADER_BYTES + wrapped_len..];

    let raw = Zeroizing::new(
        recipient
            .decrypt(oaep(), wrapped)
            .map_err(|_| CryptoError::Decrypt)?,
    );
    let content_key: [u8; aead::KEY_BYTES] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Decrypt)?;
    aead::open_payload(&content_key, sealed)
}

/// Deterministic AES key bound to an RSA private key, for sealing local
/// state (the key bag) to its owner.
pub fn derive_storage_key(owner: &RsaPrivateKey) -> Result<[u8; aead::KEY_BYTES], CryptoError> {
    let der = owner.to_pkcs8_der().map_err(|_| CryptoError::InvalidKey)?;
    Ok(crate::hash::sha256(der.as_bytes()))
}

// ---------------------------------------------------------------------------
// PEM codecs
// ---------------------------------------------------------------------------

pub fn encryption_public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidPem)
}

pub fn encryption_public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|_| CryptoError::InvalidPem)
}

pub fn encryption_private_key_to_pem(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|_| CryptoError::InvalidPem)
}

pub fn encryption_private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::InvalidPem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let (private, public) = generate_encryption_keypair().unwrap();
        let wire = rsa_seal(&public, b"entry ciphertext, possibly large").unwrap();
        assert_eq!(wire[0], ENVELOPE_VERSION);
        assert_eq!(rsa_open(&private, &wire).unwrap(), b"entry ciphertext, possibly large");
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let (private, public) = generate_encryption_keypair().unwrap();
        let payload = vec![0x5Au8; 256 * 1024];
        let wire = rsa_seal(&public, &payload).unwrap();
        assert_eq!(rsa_open(&private, &wire).unwrap(), payload);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let (_, public) = generate_encryption_keypair().unwrap();
        let (other_private, _) = generate_encryption_keypair().unwrap();
        let wire = rsa_seal(&public, b"payload").unwrap();
        assert_eq!(rsa_open(&other_private, &wire), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_tampered_version_fails() {
        let (private, public) = generate_encryption_keypair().unwrap();
        let mut wire = rsa_seal(&public, b"payload").unwrap();
        wire[0] = 0xFF;
        assert_eq!(rsa_open(&private, &wire), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_truncated_wire_fails() {
        let (private, public) = generate_encryption_keypair().unwrap();
        let wire = rsa_seal(&public, b"payload").unwrap();
        assert_eq!(rsa_open(&private, &wire[..wire.len() / 2]), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_pem_roundtrip() {
        let (private, public) = generate_encryption_keypair().unwrap();
        let pub_pem = encryption_public_key_to_pem(&public).unwrap();
        let priv_pem = encryption_private_key_to_pem(&private).unwrap();
        let wire = rsa_seal(&encryption_public_key_from_pem(&pub_pem).unwrap(), b"x").unwrap();
        let restored = encryption_private_key_from_pem(&priv_pem).unwrap();
        assert_eq!(rsa_open(&restored, &wire).unwrap(), b"x");
    }
}
