//! Redis-backed correlation store.
//!
//! # Key Pattern
//!
//! - `{prefix}{correlation_key}` - JSON-encoded `StoredAuthenticationRequest`
//!
//! `put` is `SET key value EX ttl`; `get_and_remove` is `GETDEL`, which Redis
//! executes atomically, so concurrent callers on one key see exactly one hit.
//! Each call takes its own connection so unrelated keys never queue behind a
//! shared lock.

use super::{validate_key, CorrelationStore};
use crate::errors::ExchangeError;
use crate::observability::{hash_for_correlation, metrics};
use crate::request::StoredAuthenticationRequest;
use redis::{Client, Commands};
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Default prefix for correlation keys.
pub const DEFAULT_KEY_PREFIX: &str = "exchange:correlation:";

/// Correlation store shared between relay nodes through Redis.
#[derive(Debug, Clone)]
pub struct RedisCorrelationStore {
    client: Client,
    key_prefix: String,
}

impl RedisCorrelationStore {
    /// Open a client for `redis_url`. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::CorrelationBackend`] if the URL is not a valid Redis URL.
    pub fn open(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, ExchangeError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log the URL: it may carry credentials.
            error!(
                target: "exchange.correlation",
                error = %e,
                "Failed to open Redis client"
            );
            ExchangeError::CorrelationBackend(format!("Failed to open Redis client: {e}"))
        })?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn connection(&self) -> Result<redis::Connection, ExchangeError> {
        self.client.get_connection().map_err(|e| {
            error!(
                target: "exchange.correlation",
                error = %e,
                "Failed to connect to Redis"
            );
            metrics::record_correlation_operation("connect", "error");
            ExchangeError::CorrelationBackend(format!("Failed to connect to Redis: {e}"))
        })
    }
}

impl CorrelationStore for RedisCorrelationStore {
    #[instrument(skip_all)]
    fn put(
        &self,
        key: &str,
        value: StoredAuthenticationRequest,
        ttl: Duration,
    ) -> Result<(), ExchangeError> {
        validate_key(key)?;

        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 {
            // Already expired by the time anyone could read it.
            debug!(
                target: "exchange.correlation",
                key = %hash_for_correlation(key),
                "Zero TTL, request not stored"
            );
            metrics::record_correlation_operation("put", "expired");
            return Ok(());
        }

        let payload = serde_json::to_string(&value).map_err(|e| {
            ExchangeError::CorrelationBackend(format!("Failed to serialize request: {e}"))
        })?;

        let mut conn = self.connection()?;
        conn.set_ex::<_, _, ()>(self.redis_key(key), payload, ttl_secs)
            .map_err(|e| {
                error!(
                    target: "exchange.correlation",
                    error = %e,
                    "Failed to store pending request"
                );
                metrics::record_correlation_operation("put", "error");
                ExchangeError::CorrelationBackend(format!("SET failed: {e}"))
            })?;

        debug!(
            target: "exchange.correlation",
            key = %hash_for_correlation(key),
            ttl_secs,
            "Stored pending request in Redis"
        );
        metrics::record_correlation_operation("put", "stored");
        Ok(())
    }

    #[instrument(skip_all)]
    fn get_and_remove(
        &self,
        key: &str,
    ) -> Result<Option<StoredAuthenticationRequest>, ExchangeError> {
        let mut conn = self.connection()?;
        let payload: Option<String> = conn.get_del(self.redis_key(key)).map_err(|e| {
            error!(
                target: "exchange.correlation",
                error = %e,
                "Failed to retrieve pending request"
            );
            metrics::record_correlation_operation("get_and_remove", "error");
            ExchangeError::CorrelationBackend(format!("GETDEL failed: {e}"))
        })?;

        let Some(payload) = payload else {
            metrics::record_correlation_operation("get_and_remove", "miss");
            return Ok(None);
        };

        let stored = serde_json::from_str(&payload).map_err(|e| {
            metrics::record_correlation_operation("get_and_remove", "error");
            ExchangeError::CorrelationBackend(format!("Failed to deserialize request: {e}"))
        })?;

        metrics::record_correlation_operation("get_and_remove", "hit");
        Ok(Some(stored))
    }
}
