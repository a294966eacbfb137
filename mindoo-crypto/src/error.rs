//! Error types for the crypto primitives.
//!
//! Failure variants are deliberately coarse: a decrypt failure never says
//! *why* it failed (bad key, bad tag, truncated input all look the same to
//! the caller).

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption could not be performed.
    Encrypt,
    /// Decryption or authentication failed.
    Decrypt,
    /// Signing could not be performed.
    Sign,
    /// A signature did not verify.
    InvalidSignature,
    /// Key material could not be used (wrong length, malformed DER, ...).
    InvalidKey,
    /// PEM encoding or decoding failed.
    InvalidPem,
    /// The OS random number generator failed.
    Rng,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypt => write!(f, "encryption failed"),
            Self::Decrypt => write!(f, "decryption failed"),
            Self::Sign => write!(f, "signing failed"),
            Self::InvalidSignature => write!(f, "signature verification failed"),
            Self::InvalidKey => write!(f, "invalid key material"),
            Self::InvalidPem => write!(f, "invalid PEM"),
            Self::Rng => write!(f, "random number generation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}
