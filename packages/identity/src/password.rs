//! Password Hashing
//!
//! Argon2id with a per-password salt. The time cost is tunable from
//! configuration so operators can trade latency for hardness.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

/// Default Argon2 time cost (iterations).
pub const DEFAULT_TIME_COST: u32 = 2;

/// Argon2id hasher with a configurable work factor.
pub struct Hasher {
    argon: Argon2<'static>,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_COST)
    }
}

impl Hasher {
    pub fn new(time_cost: u32) -> Self {
        let params = Params::new(
            Params::DEFAULT_M_COST,
            time_cost.max(1),
            Params::DEFAULT_P_COST,
            None,
        )
        .unwrap_or_default();
        Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Hash a password with a fresh random salt. The salt and parameters
    /// travel inside the PHC string.
    pub fn hash(&self, password: &str) -> Result<String, argon2::password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    }

    /// Verify a password against a stored PHC string. Any parse or
    /// mismatch failure reads as "no".
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        PasswordHash::new(stored)
            .map(|parsed| {
                self.argon
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = Hasher::default();
        let stored = hasher.hash("correct horse battery staple").unwrap();

        assert!(hasher.verify("correct horse battery staple", &stored));
        assert!(!hasher.verify("wrong password", &stored));
    }

    #[test]
    fn test_salts_differ_between_hashes() {
        let hasher = Hasher::default();
        let a = hasher.hash("same password").unwrap();
        let b = hasher.hash("same password").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_garbage_stored_hash_never_verifies() {
        let hasher = Hasher::default();
        assert!(!hasher.verify("anything", "not-a-phc-string"));
    }
}
