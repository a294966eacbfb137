//! Error types for the tenant, engine and trust layers.

use mindoo_crypto::CryptoError;
use mindoo_store::StoreError;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbError {
    /// Document, entry or user not found.
    NotFound(String),
    /// Read of a document that carries a valid `doc_delete`.
    DocumentDeleted(String),
    /// Delete of a document that is already deleted.
    AlreadyDeleted(String),
    /// Write to an admin-only database without the admin signing key.
    AdminOnly,
    /// A signature did not verify.
    InvalidSignature,
    /// The signing key is not trusted by the directory.
    UntrustedKey,
    /// No directory identity for that username.
    UserNotFound(String),
    /// A crypto primitive failed.
    CryptoFailure(CryptoError),
    /// No key under that id in the key bag.
    KeyNotFound(String),
    /// Pull/push between stores with different ids.
    IncompatibleStore { expected: String, actual: String },
    /// Reserved key id, malformed URI, wrong URI type, bad base64, ...
    InvalidInput(String),
    /// Underlying store failure.
    Store(StoreError),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "not found: {}", what),
            Self::DocumentDeleted(id) => write!(f, "document deleted: {}", id),
            Self::AlreadyDeleted(id) => write!(f, "document already deleted: {}", id),
            Self::AdminOnly => write!(f, "operation requires the admin signing key"),
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::UntrustedKey => write!(f, "signing key is not trusted"),
            Self::UserNotFound(name) => write!(f, "user not found: {}", name),
            Self::CryptoFailure(e) => write!(f, "crypto failure: {}", e),
            Self::KeyNotFound(id) => write!(f, "key not found: {}", id),
            Self::IncompatibleStore { expected, actual } => {
                write!(f, "incompatible store: expected '{}', got '{}'", expected, actual)
            }
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for DbError {}

impl From<CryptoError> for DbError {
    fn from(e: CryptoError) -> Self {
        Self::CryptoFailure(e)
    }
}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
