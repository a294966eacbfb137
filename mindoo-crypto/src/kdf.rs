//! Password-based key derivation: PBKDF2-HMAC-SHA256.

use getrandom::getrandom;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::aead::KEY_BYTES;
use crate::error::CryptoError;

pub const SALT_BYTES: usize = 16;

/// Default iteration count for new wrappers. Wrappers created elsewhere may
/// carry a higher count; the stored count is always the one used to unwrap.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Floor below which a wrapper is rejected outright.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Generate a random 16-byte salt.
pub fn salt() -> Result<[u8; SALT_BYTES], CryptoError> {
    let mut s = [0u8; SALT_BYTES];
    getrandom(&mut s).map_err(|_| CryptoError::Rng)?;
    Ok(s)
}

/// Derive a 256-bit AES key from a password and salt.
pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_BYTES],
    iterations: u32,
) -> Zeroizing<[u8; KEY_BYTES]> {
    let mut key = Zeroizing::new([0u8; KEY_BYTES]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, key.as_mut());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let s = [7u8; SALT_BYTES];
        let a = derive_key("correct horse", &s, DEFAULT_ITERATIONS);
        let b = derive_key("correct horse", &s, DEFAULT_ITERATIONS);
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_salt_changes_key() {
        let a = derive_key("pw", &[1u8; SALT_BYTES], DEFAULT_ITERATIONS);
        let b = derive_key("pw", &[2u8; SALT_BYTES], DEFAULT_ITERATIONS);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_password_changes_key() {
        let s = [0u8; SALT_BYTES];
        let a = derive_key("pw-one", &s, DEFAULT_ITERATIONS);
        let b = derive_key("pw-two", &s, DEFAULT_ITERATIONS);
        assert_ne!(*a, *b);
    }
}
