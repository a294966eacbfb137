//! Error types for the entry store.

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// An entry's contentHash does not match its ciphertext.
    CorruptEntry(String),
    /// An entry or dependency id fails the id grammar.
    MalformedEntry(String),
    /// On-disk state could not be read back consistently.
    StoreCorruption(String),
    /// The scan cursor could not be decoded.
    InvalidCursor(String),
    /// Underlying I/O failure.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptEntry(id) => write!(f, "corrupt entry (content hash mismatch): {}", id),
            Self::MalformedEntry(msg) => write!(f, "malformed entry: {}", msg),
            Self::StoreCorruption(msg) => write!(f, "store corruption: {}", msg),
            Self::InvalidCursor(cursor) => write!(f, "invalid scan cursor: {}", cursor),
            Self::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
