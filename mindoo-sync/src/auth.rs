//! Challenge/response authentication and data-plane tokens.
//!
//! A client asks for a nonce, signs it with its directory-registered
//! signing key, and trades it for a short-lived JWT. Nonces are UUIDv7,
//! single-use, and expire after a short TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SyncError;

pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Challenge store
// ---------------------------------------------------------------------------

struct PendingChallenge {
    username: String,
    issued: Instant,
}

/// Outstanding nonces, swept lazily on every touch.
pub struct ChallengeStore {
    pending: Mutex<HashMap<String, PendingChallenge>>,
    ttl: Duration,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a fresh nonce for `username`.
    pub async fn issue(&self, username: &str) -> String {
        let challenge = mindoo_store::idcodec::new_uuid7().to_string();
        let mut pending = self.pending.lock().await;
        let now = Instant::now();
        pending.retain(|_, c| now.duration_since(c.issued) < self.ttl);
        pending.insert(
            challenge.clone(),
            PendingChallenge {
                username: username.to_string(),
                issued: now,
            },
        );
        challenge
    }

    /// Consume a nonce, returning its username. A second consume of the
    /// same nonce fails: challenges are single-use.
    pub async fn consume(&self, challenge: &str) -> Result<String, SyncError> {
        let mut pending = self.pending.lock().await;
        let entry = pending.remove(challenge).ok_or(SyncError::ChallengeExpired)?;
        if entry.issued.elapsed() >= self.ttl {
            return Err(SyncError::ChallengeExpired);
        }
        Ok(entry.username)
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

pub fn issue_token(secret: &[u8], username: &str, ttl: Duration) -> Result<String, SyncError> {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| SyncError::Server("clock before epoch".into()))?
        .as_secs()
        + ttl.as_secs();
    let claims = Claims {
        sub: username.to_string(),
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| SyncError::Server(format!("token encode: {}", e)))
}

/// Verify a token and return the subject username. Expiry is enforced.
pub fn verify_token(secret: &[u8], token: &str) -> Result<String, SyncError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .map_err(|_| SyncError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_challenge_single_use() {
        let store = ChallengeStore::new(DEFAULT_CHALLENGE_TTL);
        let challenge = store.issue("alice").await;
        assert_eq!(store.consume(&challenge).await.unwrap(), "alice");
        assert_eq!(
            store.consume(&challenge).await.unwrap_err(),
            SyncError::ChallengeExpired
        );
    }

    #[tokio::test]
    async fn test_challenge_ttl_expiry() {
        let store = ChallengeStore::new(Duration::from_millis(10));
        let challenge = store.issue("alice").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.consume(&challenge).await.unwrap_err(),
            SyncError::ChallengeExpired
        );
    }

    #[tokio::test]
    async fn test_unknown_challenge_rejected() {
        let store = ChallengeStore::new(DEFAULT_CHALLENGE_TTL);
        assert_eq!(
            store.consume("not-issued").await.unwrap_err(),
            SyncError::ChallengeExpired
        );
    }

    #[test]
    fn test_token_roundtrip() {
        let token = issue_token(b"secret", "alice", DEFAULT_TOKEN_TTL).unwrap();
        assert_eq!(verify_token(b"secret", &token).unwrap(), "alice");
        assert_eq!(
            verify_token(b"other-secret", &token).unwrap_err(),
            SyncError::InvalidToken
        );
        assert_eq!(
            verify_token(b"secret", "garbage").unwrap_err(),
            SyncError::InvalidToken
        );
    }
}
