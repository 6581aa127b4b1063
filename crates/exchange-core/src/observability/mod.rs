//! Observability for the exchange core.
//!
//! # Privacy by Default
//!
//! Public operations use `#[instrument(skip_all)]` and log only allow-listed
//! fields:
//! - **SAFE**: error kinds, algorithm names, counts, outcomes
//! - **HASHED**: request ids and correlation keys (see [`hash_for_correlation`])
//! - **NEVER**: token secrets, raw token bytes, response XML, remote IP addresses

pub mod metrics;

use sha2::{Digest, Sha256};

/// Hash a value for correlation in logs (SHA-256, first 8 hex chars).
///
/// This is a one-way label for joining log lines, not a secret-hiding
/// mechanism. Do not use it on token secrets.
pub fn hash_for_correlation(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest.get(..4).unwrap_or_default())
}
