use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use thiserror::Error;

/// Result of a check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// The key was absent (or expired) and is now recorded.
    New,
    /// The key was recorded earlier and has not expired.
    Duplicate,
}

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key-existence store used for deduplication.
///
/// `check_and_set` must be atomic per key: of any number of concurrent calls
/// with the same key, exactly one observes `Sighting::New`.
#[async_trait]
pub trait DedupeCache: Send + Sync {
    async fn check_and_set(&self, key: u128, ttl: Duration) -> Result<Sighting, CacheError>;

    /// Drop everything held. Called once the pipeline has stopped.
    async fn release(&self) {}
}

#[derive(Debug, Clone)]
struct SeenKey {
    first_seen: DateTime<Utc>,
    ttl: Duration,
}

/// Each entry lives for the TTL it was inserted with. Reads do not extend it.
struct InsertionTtl;

impl Expiry<u128, SeenKey> for InsertionTtl {
    fn expire_after_create(
        &self,
        _key: &u128,
        value: &SeenKey,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache: entries expire by TTL first, and the least recently used
/// ones are evicted once `max_entries` is exceeded.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Cache<u128, SeenKey>,
}

impl MemoryCache {
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .name("dedupe")
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(InsertionTtl)
            .build();

        Self { entries }
    }

    /// Approximate number of live entries; run `sync` first for an exact count.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Apply pending evictions and expirations.
    pub async fn sync(&self) {
        self.entries.run_pending_tasks().await;
    }

    pub async fn first_seen(&self, key: u128) -> Option<DateTime<Utc>> {
        self.entries.get(&key).await.map(|seen| seen.first_seen)
    }
}

#[async_trait]
impl DedupeCache for MemoryCache {
    async fn check_and_set(&self, key: u128, ttl: Duration) -> Result<Sighting, CacheError> {
        let entry = self
            .entries
            .entry(key)
            .or_insert(SeenKey {
                first_seen: Utc::now(),
                ttl,
            })
            .await;

        if entry.is_fresh() {
            Ok(Sighting::New)
        } else {
            Ok(Sighting::Duplicate)
        }
    }

    async fn release(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }
}
