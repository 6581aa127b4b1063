use super::{validate_key, CorrelationStore};
use crate::errors::ExchangeError;
use crate::observability::{hash_for_correlation, metrics};
use crate::request::StoredAuthenticationRequest;
use chrono::{DateTime, Utc};
use common::clock::{Clock, SystemClock};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Every this many `put`s the store sweeps expired entries.
pub const SWEEP_INTERVAL: usize = 256;

/// A stored request and the instant it stops being retrievable.
#[derive(Debug, Clone)]
pub struct CorrelationEntry {
    value: StoredAuthenticationRequest,
    expires_at: DateTime<Utc>,
}

impl CorrelationEntry {
    pub fn new(value: StoredAuthenticationRequest, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// An entry is dead from its expiry instant onward.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-process correlation store.
///
/// Entries live in a sharded `DashMap`, so writers to different keys touch
/// different shard locks. `get_and_remove` is a single `DashMap::remove`,
/// which is atomic per key. Expired entries are dropped on access, and
/// every [`SWEEP_INTERVAL`] puts by [`InMemoryCorrelationStore::sweep_expired`]
/// so abandoned exchanges do not accumulate.
#[derive(Debug)]
pub struct InMemoryCorrelationStore {
    entries: DashMap<String, CorrelationEntry>,
    puts: AtomicUsize,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCorrelationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            puts: AtomicUsize::new(0),
            clock,
        }
    }

    /// Drop every expired entry and return how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(target: "exchange.correlation", removed, "Swept expired correlation entries");
        }
        metrics::record_correlation_operation("sweep", "completed");
        removed
    }

    /// Physically present entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CorrelationStore for InMemoryCorrelationStore {
    fn put(
        &self,
        key: &str,
        value: StoredAuthenticationRequest,
        ttl: Duration,
    ) -> Result<(), ExchangeError> {
        validate_key(key)?;

        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries
            .insert(key.to_string(), CorrelationEntry::new(value, expires_at));

        debug!(
            target: "exchange.correlation",
            key = %hash_for_correlation(key),
            "Stored pending request"
        );
        metrics::record_correlation_operation("put", "stored");

        let puts = self.puts.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if puts % SWEEP_INTERVAL == 0 {
            self.sweep_expired();
        }
        Ok(())
    }

    fn get_and_remove(
        &self,
        key: &str,
    ) -> Result<Option<StoredAuthenticationRequest>, ExchangeError> {
        let Some((_, entry)) = self.entries.remove(key) else {
            metrics::record_correlation_operation("get_and_remove", "miss");
            return Ok(None);
        };

        if entry.is_expired(self.clock.now()) {
            debug!(
                target: "exchange.correlation",
                key = %hash_for_correlation(key),
                "Pending request expired before retrieval"
            );
            metrics::record_correlation_operation("get_and_remove", "expired");
            return Ok(None);
        }

        metrics::record_correlation_operation("get_and_remove", "hit");
        Ok(Some(entry.value))
    }
}
