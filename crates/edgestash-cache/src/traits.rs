use crate::key::CacheKey;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A response variant committed to the store.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub expires_at: SystemTime,
    /// Names from the response's own `Vary` header.
    pub vary_names: Vec<String>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// Time since the entry was stored, zero if the clock went backwards.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }

    /// Remaining freshness at `now`.
    pub fn ttl_remaining(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or_default()
    }
}

/// Snapshot of cache statistics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Key/value contract the variant store is built on.
///
/// Implementations must make `put` and `remove_if` atomic with respect to
/// concurrent `get`: a reader sees either the previous entry or the complete
/// new one.
pub trait EntryStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StoreError>;

    /// Insert or replace the entry stored under `entry.key`.
    fn put(&self, entry: Arc<CacheEntry>) -> Result<(), StoreError>;

    /// Remove the entry under `key` only if `pred` holds for it.
    fn remove_if(
        &self,
        key: &CacheKey,
        pred: &dyn Fn(&CacheEntry) -> bool,
    ) -> Result<bool, StoreError>;

    /// Keep only the entries for which `keep` returns true. Returns how many
    /// were dropped.
    fn retain(&self, keep: &mut dyn FnMut(&CacheEntry) -> bool) -> Result<usize, StoreError>;

    /// Number of entries currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    fn capacity(&self) -> usize;

    /// Entries dropped to respect the capacity bound.
    fn evictions(&self) -> u64;

    /// Human-readable backend name.
    fn name(&self) -> &'static str;
}
