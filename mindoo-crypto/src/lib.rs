//! # Mindoo Crypto
//!
//! Crypto primitives for the MindooDB sync substrate.
//!
//! Every mutation in a Mindoo database is sealed with AES-256-GCM, signed
//! over the ciphertext with Ed25519, and (on the network) wrapped a second
//! time to the receiving peer with an RSA-OAEP hybrid envelope. Passwords
//! protect key material through PBKDF2-SHA256 wrapping.
//!
//! ## Quick Start
//!
//! ```rust
//! use mindoo_crypto::{aead, sign};
//!
//! let key = aead::generate_key().unwrap();
//! let sealed = aead::seal_payload(&key, b"doc change").unwrap();
//!
//! let sk = sign::generate_signing_key();
//! let sig = sign::sign(&sk, &sealed);
//! assert!(sign::verify_ok(&sk.verifying_key(), &sealed, &sig));
//!
//! assert_eq!(aead::open_payload(&key, &sealed).unwrap(), b"doc change");
//! ```
//!
//! ## What's NOT Provided
//!
//! - Key management (see `mindoo-core`'s KeyBag)
//! - Trust decisions (see `mindoo-core`'s directory)
//! - Constant-time guarantees beyond what the underlying crates give

#![deny(unsafe_code)]

pub mod aead;
pub mod b64;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod sign;
pub mod wrap;

pub use error::CryptoError;
pub use wrap::EncryptedKey;

// Re-export the key types callers hold.
pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use rsa::{RsaPrivateKey, RsaPublicKey};
