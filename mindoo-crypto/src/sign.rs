//! Ed25519 signing and verification, with PKCS#8 PEM codecs.
//!
//! Public keys travel as PEM strings inside store entries and directory
//! records; private keys only ever leave memory password-wrapped.

use ed25519_dalek::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pkcs8::LineEnding;
use rand_core::OsRng;

use crate::error::CryptoError;

pub const SIGNATURE_BYTES: usize = 64;

/// Generate a fresh Ed25519 signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Sign `message`, returning the 64-byte signature.
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Verify `signature` over `message` under `key`.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let sig = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify_strict(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Like [`verify`] but returns a bool; malformed signatures count as false.
pub fn verify_ok(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    verify(key, message, signature).is_ok()
}

// ---------------------------------------------------------------------------
// PEM codecs
// ---------------------------------------------------------------------------

pub fn verifying_key_to_pem(key: &VerifyingKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::InvalidPem)
}

pub fn verifying_key_from_pem(pem: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|_| CryptoError::InvalidPem)
}

pub fn signing_key_to_pem(key: &SigningKey) -> Result<String, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|_| CryptoError::InvalidPem)
}

pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey, CryptoError> {
    SigningKey::from_pkcs8_pem(pem).map_err(|_| CryptoError::InvalidPem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let sk = generate_signing_key();
        let sig = sign(&sk, b"entry ciphertext");
        assert_eq!(sig.len(), SIGNATURE_BYTES);
        assert!(verify(&sk.verifying_key(), b"entry ciphertext", &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let sk = generate_signing_key();
        let sig = sign(&sk, b"original");
        assert_eq!(
            verify(&sk.verifying_key(), b"tampered", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let sk = generate_signing_key();
        let other = generate_signing_key();
        let sig = sign(&sk, b"msg");
        assert!(!verify_ok(&other.verifying_key(), b"msg", &sig));
    }

    #[test]
    fn test_malformed_signature_is_false() {
        let sk = generate_signing_key();
        assert!(!verify_ok(&sk.verifying_key(), b"msg", &[0u8; 10]));
    }

    #[test]
    fn test_public_pem_roundtrip() {
        let sk = generate_signing_key();
        let pem = verifying_key_to_pem(&sk.verifying_key()).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        let restored = verifying_key_from_pem(&pem).unwrap();
        assert_eq!(restored, sk.verifying_key());
    }

    #[test]
    fn test_private_pem_roundtrip() {
        let sk = generate_signing_key();
        let pem = signing_key_to_pem(&sk).unwrap();
        let restored = signing_key_from_pem(&pem).unwrap();
        let sig = sign(&restored, b"msg");
        assert!(verify_ok(&sk.verifying_key(), b"msg", &sig));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert_eq!(
            verifying_key_from_pem("not a pem").unwrap_err(),
            CryptoError::InvalidPem
        );
    }
}
