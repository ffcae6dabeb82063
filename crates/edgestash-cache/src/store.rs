use crate::error::CacheError;
use crate::key::{CacheKey, ResourceId};
use crate::origin::OriginResponse;
use crate::traits::{CacheEntry, CacheStats, EntryStore};
use http::HeaderMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Most recently learned `Vary` names per resource.
///
/// A request cannot know which of its headers matter until a response for the
/// same resource has told us, so lookups consult this index before deriving a
/// key. Resources that vary on nothing are not recorded. Names for resources
/// whose entries are evicted stay until the next `VariantStore::sweep_expired`,
/// which is what bounds the index for varying resources.
#[derive(Default)]
pub struct VaryIndex {
    names: RwLock<HashMap<ResourceId, Learned>>,
    generation: AtomicU64,
}

struct Learned {
    names: Vec<String>,
    /// Sweep generation current when the names were learned.
    generation: u64,
}

impl VaryIndex {
    /// Learned names for `resource`; empty if nothing was learned yet.
    pub fn get(&self, resource: &ResourceId) -> Vec<String> {
        self.names
            .read()
            .get(resource)
            .map(|learned| learned.names.clone())
            .unwrap_or_default()
    }

    pub fn learn(&self, resource: &ResourceId, vary_names: Vec<String>) {
        if vary_names.is_empty() {
            self.names.write().remove(resource);
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        self.names.write().insert(
            resource.clone(),
            Learned {
                names: vary_names,
                generation,
            },
        );
    }

    /// Open a new sweep generation and return the one it replaces. Names
    /// learned from now on carry a later generation.
    fn begin_sweep(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Forget resources outside `live`, except those learned after the sweep
    /// that produced `live` began.
    fn prune(&self, live: &HashSet<ResourceId>, swept: u64) {
        self.names
            .write()
            .retain(|resource, learned| learned.generation > swept || live.contains(resource));
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expiration-aware mapping from derived keys to committed variants.
///
/// Any number of variants of one resource coexist, each under the key built
/// from its Vary-selected request header values. An entry whose `expires_at`
/// is not after `now` is treated as absent and removed when a lookup sees it.
pub struct VariantStore {
    entries: Arc<dyn EntryStore>,
    vary_index: VaryIndex,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl VariantStore {
    pub fn new(entries: Arc<dyn EntryStore>) -> Self {
        tracing::info!(
            backend = entries.name(),
            capacity = entries.capacity(),
            "variant store initialized"
        );

        Self {
            entries,
            vary_index: VaryIndex::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Find a fresh variant of `resource` matching `request_headers`.
    ///
    /// A backend failure is reported as a miss so the request still reaches
    /// the origin.
    pub fn lookup(
        &self,
        resource: &ResourceId,
        request_headers: &HeaderMap,
        now: SystemTime,
    ) -> Option<Arc<CacheEntry>> {
        let vary_names = self.vary_index.get(resource);
        let key = CacheKey::derive(resource, request_headers, &vary_names);

        match self.entries.get(&key) {
            Ok(Some(entry)) if entry.is_fresh(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(Some(_)) => {
                // Only drop it if a concurrent commit has not already replaced it.
                match self.entries.remove_if(&key, &|e| !e.is_fresh(now)) {
                    Ok(true) => {
                        self.expirations.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key = %key, "evicted expired entry");
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, key = %key, "failed to evict expired entry"),
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "store lookup failed, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `response` as the variant selected by `request_headers` under the
    /// response's own `vary_names`, replacing any entry with the same key.
    ///
    /// The Vary index for the resource is switched to `vary_names` once the
    /// entry is in place.
    pub fn commit(
        &self,
        resource: &ResourceId,
        request_headers: &HeaderMap,
        vary_names: Vec<String>,
        response: &OriginResponse,
        now: SystemTime,
        expires_at: SystemTime,
    ) -> Result<Arc<CacheEntry>, CacheError> {
        let key = CacheKey::derive(resource, request_headers, &vary_names);
        let entry = Arc::new(CacheEntry {
            key,
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: now,
            expires_at: expires_at.max(now),
            vary_names: vary_names.clone(),
        });

        self.entries.put(Arc::clone(&entry))?;
        self.vary_index.learn(resource, vary_names);

        tracing::debug!(
            key = %entry.key,
            status = entry.status.as_u16(),
            ttl_secs = entry.ttl_remaining(now).as_secs(),
            "committed variant"
        );

        Ok(entry)
    }

    /// Drop every entry that is no longer fresh at `now`, and forget the Vary
    /// names of resources with no remaining entries. Returns the number of
    /// entries dropped.
    ///
    /// A commit racing the sweep keeps its names: its entry is either seen by
    /// the scan or its names are learned under a later generation.
    pub fn sweep_expired(&self, now: SystemTime) -> Result<usize, CacheError> {
        let swept = self.vary_index.begin_sweep();
        let mut live: HashSet<ResourceId> = HashSet::new();
        let dropped = self.entries.retain(&mut |entry| {
            let fresh = entry.is_fresh(now);
            if fresh {
                live.insert(entry.key.resource.clone());
            }
            fresh
        })?;
        self.vary_index.prune(&live, swept);
        self.expirations.fetch_add(dropped as u64, Ordering::Relaxed);
        Ok(dropped)
    }

    /// Vary names currently learned for `resource`.
    pub fn vary_names(&self, resource: &ResourceId) -> Vec<String> {
        self.vary_index.get(resource)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn backend_name(&self) -> &'static str {
        self.entries.name()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.entries.evictions() + self.expirations.load(Ordering::Relaxed),
            current_size: self.entries.len(),
            capacity: self.entries.capacity(),
        }
    }
}
