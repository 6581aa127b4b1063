//! Correlation between an outgoing request and its eventual response.
//!
//! A [`CorrelationStore`] is a time-bounded, remove-on-read map. Retrieval
//! is at-most-once per inserted entry: that single-use lifetime is what
//! stops a response from being replayed against the same stored request.
//!
//! Two backends ship with the core:
//! - [`InMemoryCorrelationStore`]: sharded `DashMap`, lazy expiry
//! - [`RedisCorrelationStore`]: `SET .. EX` plus `GETDEL`, for multi-node
//!   deployments

mod memory;
mod redis_store;

pub use self::memory::{CorrelationEntry, InMemoryCorrelationStore, SWEEP_INTERVAL};
pub use self::redis_store::{RedisCorrelationStore, DEFAULT_KEY_PREFIX};

use crate::errors::ExchangeError;
use crate::request::StoredAuthenticationRequest;
use std::time::Duration;

/// Remove-on-read cache of pending requests.
///
/// Implementations must let operations on different keys proceed without
/// blocking one another, and must make `get_and_remove` linearizable per key:
/// of any number of concurrent callers, exactly one observes a live entry.
pub trait CorrelationStore: Send + Sync {
    /// Insert or overwrite `key`. The entry is treated as absent once `ttl`
    /// has elapsed.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidKey`] for a blank key;
    /// [`ExchangeError::CorrelationBackend`] if the backing cache fails.
    fn put(
        &self,
        key: &str,
        value: StoredAuthenticationRequest,
        ttl: Duration,
    ) -> Result<(), ExchangeError>;

    /// Atomically fetch and delete `key`. Missing and expired entries both
    /// yield `None`.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::CorrelationBackend`] if the backing cache fails.
    fn get_and_remove(&self, key: &str)
        -> Result<Option<StoredAuthenticationRequest>, ExchangeError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), ExchangeError> {
    if key.trim().is_empty() {
        return Err(ExchangeError::InvalidKey);
    }
    Ok(())
}
