//! Salted credential records for agent instances
//!
//! Secrets are never stored: each record holds a random 128-bit salt and the
//! scrypt hash of the secret, both hex-encoded in the instance's `agent.cfg`.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// scrypt cost parameters: N = 2^14, r = 8, p = 1, 64-byte output
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const HASH_LEN: usize = 64;
const SALT_LEN: usize = 16;

/// Hex-encoded salt and scrypt hash as persisted to `agent.cfg`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub salt: String,
    pub hashed_secret: String,
}

impl CredentialRecord {
    /// Create a record for a new secret with a fresh random salt
    pub fn new(secret: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        Self {
            salt: hex::encode(salt),
            hashed_secret: hex::encode(hash_secret(secret, &salt)),
        }
    }

    /// Recompute the hash with the stored salt and compare byte-for-byte.
    ///
    /// Returns false for a wrong secret or a corrupt record; never errors.
    pub fn verify(&self, secret: &str) -> bool {
        let salt = match hex::decode(&self.salt) {
            Ok(salt) => salt,
            Err(_) => return false,
        };
        let stored = match hex::decode(&self.hashed_secret) {
            Ok(stored) => stored,
            Err(_) => return false,
        };

        fixed_time_eq(&hash_secret(secret, &salt), &stored)
    }
}

fn hash_secret(secret: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, HASH_LEN)
        .expect("constant scrypt parameters are valid");
    let mut output = [0u8; HASH_LEN];
    scrypt::scrypt(secret.as_bytes(), salt, &params, &mut output)
        .expect("output length matches params");
    output
}

/// Compare without short-circuiting on the first mismatched byte
fn fixed_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = CredentialRecord::new("secret");
        assert!(record.verify("secret"));
        assert!(!record.verify("wrong"));
        assert!(!record.verify(""));
    }

    #[test]
    fn test_salts_are_random() {
        let a = CredentialRecord::new("secret");
        let b = CredentialRecord::new("secret");

        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hashed_secret, b.hashed_secret);
        assert!(a.verify("secret"));
        assert!(b.verify("secret"));
    }

    #[test]
    fn test_salt_is_128_bits() {
        let record = CredentialRecord::new("secret");
        assert_eq!(record.salt.len(), 32); // 16 bytes, hex encoded
    }

    #[test]
    fn test_corrupt_record_never_verifies() {
        let mut record = CredentialRecord::new("secret");
        record.salt = "not-hex".to_string();
        assert!(!record.verify("secret"));

        let mut record = CredentialRecord::new("secret");
        record.hashed_secret = "zz".to_string();
        assert!(!record.verify("secret"));
    }

    #[test]
    fn test_fixed_time_eq() {
        assert!(fixed_time_eq(b"abc", b"abc"));
        assert!(!fixed_time_eq(b"abc", b"abd"));
        assert!(!fixed_time_eq(b"abc", b"ab"));
        assert!(fixed_time_eq(b"", b""));
    }
}
