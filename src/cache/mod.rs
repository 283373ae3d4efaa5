pub mod clock;
pub mod disk;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{QueryFingerprint, QueryResult};
use crate::error::CacheError;

pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::DiskCache;

/// Trait for query result cache implementations
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Live entry for `fingerprint`, or `None` on miss. Expired entries are
    /// purged before returning.
    async fn get(&self, fingerprint: &QueryFingerprint) -> Result<Option<CacheEntry>, CacheError>;

    /// Store a result, evicting the oldest-inserted entry when full
    async fn put(&self, fingerprint: &QueryFingerprint, result: &QueryResult) -> Result<(), CacheError>;

    /// Remove every entry past its TTL, returning how many were dropped
    async fn invalidate_expired(&self) -> Result<usize, CacheError>;

    /// Get cache statistics
    async fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Drop all entries
    async fn clear(&self) -> Result<(), CacheError>;

    /// Persist in-memory state (called on shutdown)
    async fn flush(&self) -> Result<(), CacheError>;
}

/// Cached result with its lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: QueryFingerprint,
    pub result: QueryResult,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expires_at(self.created_at, self.ttl)
    }

    /// Expired once `now >= created_at + ttl`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.created_at, self.ttl, now)
    }
}

/// `None` when the expiry does not fit in a timestamp (never expires)
pub(crate) fn expires_at(created_at: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
}

pub(crate) fn is_expired(created_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    expires_at(created_at, ttl).map_or(false, |deadline| now >= deadline)
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: u64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}
