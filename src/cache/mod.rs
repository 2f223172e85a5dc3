pub mod backend;

pub use backend::{CacheBackend, InMemoryBackend, SledBackend};

use crate::config::CacheConfig;
use crate::engine::FetchResult;
use crate::providers::normalize_query_key;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const POSITIVE_PREFIX: &str = "result:";
const NEGATIVE_PREFIX: &str = "negative:";

/// A cached fetch result, positive or negative, stamped at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: FetchResult,
    pub cached_at: DateTime<Utc>,
    pub negative: bool,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// A cache hit annotated with freshness flags.
///
/// `expired` implies `stale`: the stale boundary sits one revalidation
/// window before expiry.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub entry: CacheEntry,
    pub stale: bool,
    pub expired: bool,
}

/// Positive/negative result cache over a pluggable backend.
///
/// Positive and negative entries live in separate key namespaces so a found
/// result never collides with a recorded miss for the same title. Entries
/// past their stale boundary are still served (flagged, so the orchestrator
/// can refresh in the background); entries past expiry are withheld unless
/// the caller explicitly allows them.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    fn positive_key(title: &str) -> String {
        format!("{POSITIVE_PREFIX}{}", normalize_query_key(title))
    }

    fn negative_key(title: &str) -> String {
        format!("{NEGATIVE_PREFIX}{}", normalize_query_key(title))
    }

    fn freshness(&self, entry: &CacheEntry) -> (bool, bool) {
        let max_age = if entry.negative {
            self.config.max_age_not_found()
        } else {
            self.config.max_age_success()
        };
        let stale_boundary = max_age.saturating_sub(self.config.stale_while_revalidate());
        let age = entry.age(Utc::now());
        (age > stale_boundary, age > max_age)
    }

    async fn fetch(&self, key: &str, allow_expired: bool) -> Result<Option<CacheLookup>> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let entry: CacheEntry =
            bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        let (stale, expired) = self.freshness(&entry);
        if expired && !allow_expired {
            debug!(key, "cache entry expired, withholding");
            return Ok(None);
        }
        Ok(Some(CacheLookup {
            entry,
            stale,
            expired,
        }))
    }

    async fn store(&self, key: String, payload: &FetchResult, negative: bool) -> Result<()> {
        let entry = CacheEntry {
            payload: payload.clone(),
            cached_at: Utc::now(),
            negative,
        };
        let bytes =
            bincode::serialize(&entry).map_err(|e| Error::Serialization(e.to_string()))?;
        self.backend.set(&key, bytes).await?;
        self.evict_if_over_capacity().await?;
        Ok(())
    }

    /// Fresh-or-stale positive entry for a title; expired entries are withheld.
    pub async fn get(&self, title: &str) -> Result<Option<CacheLookup>> {
        self.fetch(&Self::positive_key(title), false).await
    }

    /// Positive entry regardless of expiry, for callers that opted into
    /// serving arbitrarily old data.
    pub async fn get_allow_expired(&self, title: &str) -> Result<Option<CacheLookup>> {
        self.fetch(&Self::positive_key(title), true).await
    }

    /// Non-expired negative entry for a title.
    pub async fn get_negative(&self, title: &str) -> Result<Option<CacheLookup>> {
        self.fetch(&Self::negative_key(title), false).await
    }

    /// Record a successful result; resets the entry's TTL clock.
    pub async fn set(&self, title: &str, result: &FetchResult) -> Result<()> {
        self.store(Self::positive_key(title), result, false).await
    }

    /// Record a failed lookup under the negative namespace (short TTL).
    pub async fn set_negative(&self, title: &str, result: &FetchResult) -> Result<()> {
        self.store(Self::negative_key(title), result, true).await
    }

    /// Drop both the positive and negative entries for a title.
    pub async fn delete(&self, title: &str) -> Result<()> {
        self.backend.delete(&Self::positive_key(title)).await?;
        self.backend.delete(&Self::negative_key(title)).await?;
        Ok(())
    }

    /// When an insert pushes the backend past capacity, evict the oldest 10%
    /// of entries by write time. LRU-by-write, not by access.
    async fn evict_if_over_capacity(&self) -> Result<()> {
        if self.config.capacity == 0 {
            return Ok(());
        }
        let len = self.backend.len().await?;
        if len <= self.config.capacity {
            return Ok(());
        }

        let mut stamped: Vec<(String, DateTime<Utc>)> = Vec::with_capacity(len);
        for key in self.backend.keys().await? {
            if let Some(bytes) = self.backend.get(&key).await? {
                if let Ok(entry) = bincode::deserialize::<CacheEntry>(&bytes) {
                    stamped.push((key, entry.cached_at));
                }
            }
        }
        stamped.sort_by_key(|(_, cached_at)| *cached_at);

        let evict_count = (self.config.capacity / 10).max(1);
        for (key, _) in stamped.into_iter().take(evict_count) {
            self.backend.delete(&key).await?;
        }
        info!(evicted = evict_count, "cache over capacity, evicted oldest");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, title: &str, negative: bool, age: Duration) -> Result<()> {
        let key = if negative {
            Self::negative_key(title)
        } else {
            Self::positive_key(title)
        };
        let Some(bytes) = self.backend.get(&key).await? else {
            return Ok(());
        };
        let mut entry: CacheEntry =
            bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        entry.cached_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
        let bytes =
            bincode::serialize(&entry).map_err(|e| Error::Serialization(e.to_string()))?;
        self.backend.set(&key, bytes).await
    }
}
