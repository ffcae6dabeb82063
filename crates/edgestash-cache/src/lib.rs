//! Caching core of the edgestash HTTP edge cache.
//!
//! A request flows through [`coordinator::Coordinator::obtain`]: the
//! [`store::VariantStore`] is consulted with a key built by
//! [`key::CacheKey::derive`] from the Vary names learned for the resource. On a
//! miss the coordinator single-flights one origin fetch per resource, evaluates
//! the response with [`freshness::FreshnessPolicy`] and commits cacheable
//! responses under a key refined by the response's own `Vary`.

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod freshness;
pub mod key;
pub mod origin;
pub mod sharded;
pub mod store;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CacheStatus, Coordinator, FetchPolicy, Obtained};
pub use error::CacheError;
pub use freshness::{Freshness, FreshnessPolicy};
pub use key::{CacheKey, ResourceId};
pub use origin::{Origin, OriginError, OriginRequest, OriginResponse};
pub use sharded::ShardedStore;
pub use store::VariantStore;
pub use traits::{CacheEntry, CacheStats, EntryStore, StoreError};
