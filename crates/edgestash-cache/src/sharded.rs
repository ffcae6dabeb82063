use crate::key::CacheKey;
use crate::traits::{CacheEntry, EntryStore, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

struct Shard {
    entries: HashMap<CacheKey, Arc<CacheEntry>>,
    capacity: usize,
}

impl Shard {
    /// Drop the entry closest to expiry. Already-expired entries sort first.
    ///
    /// Linear in the shard size and run under the shard write lock, so the
    /// cost of an insert into a full shard grows with `capacity / 64`.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }
}

/// In-memory sharded entry store.
///
/// Keys are spread over 64 shards, each a `HashMap` behind its own `RwLock`,
/// so lookups on different resources rarely contend. Entries are swapped in
/// whole as `Arc<CacheEntry>`, which keeps readers from ever seeing a partial
/// write.
///
/// Each shard holds at most `total_capacity / 64` entries (minimum 1). When a
/// new key arrives at a full shard the entry nearest to expiry is dropped.
///
/// Shard selection uses `ahash` for fast, DoS-resistant hashing.
pub struct ShardedStore {
    shards: Box<[RwLock<Shard>; NUM_SHARDS]>,
    evictions: AtomicU64,
}

impl ShardedStore {
    pub fn new(total_capacity: usize) -> Self {
        let per_shard = (total_capacity / NUM_SHARDS).max(1);
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS)
            .map(|_| {
                RwLock::new(Shard {
                    entries: HashMap::new(),
                    capacity: per_shard,
                })
            })
            .collect();

        let shards: Box<[RwLock<Shard>; NUM_SHARDS]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!());

        Self {
            shards,
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(key: &CacheKey) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    fn shard(&self, key: &CacheKey) -> &RwLock<Shard> {
        &self.shards[Self::shard_index(key)]
    }
}

impl EntryStore for ShardedStore {
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>, StoreError> {
        Ok(self.shard(key).read().entries.get(key).cloned())
    }

    fn put(&self, entry: Arc<CacheEntry>) -> Result<(), StoreError> {
        let mut shard = self.shard(&entry.key).write();

        if !shard.entries.contains_key(&entry.key) {
            while shard.entries.len() >= shard.capacity {
                if !shard.evict_one() {
                    break;
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        shard.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove_if(
        &self,
        key: &CacheKey,
        pred: &dyn Fn(&CacheEntry) -> bool,
    ) -> Result<bool, StoreError> {
        let mut shard = self.shard(key).write();
        let matched = shard.entries.get(key).is_some_and(|entry| pred(&**entry));
        if matched {
            shard.entries.remove(key);
        }
        Ok(matched)
    }

    fn retain(&self, keep: &mut dyn FnMut(&CacheEntry) -> bool) -> Result<usize, StoreError> {
        let mut dropped = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let before = shard.entries.len();
            shard.entries.retain(|_, entry| keep(&**entry));
            dropped += before - shard.entries.len();
        }
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }

    fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.read().capacity).sum()
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        "sharded-memory"
    }
}
