//! Bearer Tokens
//!
//! Tokens are 32 random bytes, hex-encoded, opaque to clients. Only the
//! sha256 digest is ever persisted, so a leaked store dump cannot be
//! replayed as live credentials.

use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

/// Mint a fresh opaque bearer token.
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Digest used as the storage key for a token.
pub fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
