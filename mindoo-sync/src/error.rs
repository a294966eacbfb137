//! Error types for the sync protocol.

use mindoo_core::DbError;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// Missing, expired or malformed data-plane token.
    InvalidToken,
    /// The authenticated user has been revoked.
    UserRevoked,
    /// No directory identity for that username.
    UserNotFound,
    /// Challenge nonce unknown, expired, or already used.
    ChallengeExpired,
    /// A pushed entry failed signature/trust validation.
    InvalidSignature,
    /// The request did not complete within the attempt timeout. Retriable.
    Timeout,
    /// Transport-level failure. Retriable.
    Network(String),
    /// The server answered outside the protocol contract.
    Server(String),
    /// The caller cancelled the in-flight request.
    Cancelled,
    /// Malformed request or response payload.
    InvalidInput(String),
    /// Local database failure below the protocol.
    Db(DbError),
}

impl SyncError {
    /// Whether the transport should retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }

    /// Stable wire name, carried in error bodies.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::InvalidToken => "InvalidToken",
            Self::UserRevoked => "UserRevoked",
            Self::UserNotFound => "UserNotFound",
            Self::ChallengeExpired => "ChallengeExpired",
            Self::InvalidSignature => "InvalidSignature",
            Self::Timeout => "Timeout",
            Self::Network(_) => "NetworkError",
            Self::Server(_) => "ServerError",
            Self::Cancelled => "Cancelled",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Db(_) => "ServerError",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken => write!(f, "invalid or expired token"),
            Self::UserRevoked => write!(f, "user has been revoked"),
            Self::UserNotFound => write!(f, "user not found"),
            Self::ChallengeExpired => write!(f, "challenge expired or already used"),
            Self::InvalidSignature => write!(f, "entry failed signature validation"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Server(msg) => write!(f, "server error: {}", msg),
            Self::Cancelled => write!(f, "request cancelled"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::Db(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        Self::Db(e)
    }
}

impl From<mindoo_store::StoreError> for SyncError {
    fn from(e: mindoo_store::StoreError) -> Self {
        Self::Db(DbError::Store(e))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}
