//! Request authentication
//!
//! Axum middleware that resolves a usable credential for every proxied
//! request and attaches it as a typed extension, plus small helpers for
//! logging tokens without disclosing them.

pub mod middleware;

pub use middleware::{AuthState, InstanceAuth, credential_auth, lightweight_auth};

use sha2::{Digest, Sha256};

/// Short, non-reversible identifier for a token, safe to log.
///
/// Two log lines with the same fingerprint carried the same token; the
/// token itself never appears in output.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}
