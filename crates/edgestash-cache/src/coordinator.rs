use crate::clock::Clock;
use crate::error::CacheError;
use crate::freshness::FreshnessPolicy;
use crate::key::{parse_vary, CacheKey, ResourceId};
use crate::origin::{Origin, OriginError, OriginRequest, OriginResponse};
use crate::store::VariantStore;
use crate::traits::CacheEntry;
use arc_swap::ArcSwap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use http::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store without contacting the origin.
    Hit,
    /// This request performed the origin fetch.
    Miss,
    /// Answered by another request's in-flight fetch for the same key.
    Coalesced,
    /// Method is not cacheable; forwarded straight to the origin.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Obtained {
    pub response: OriginResponse,
    pub status: CacheStatus,
    /// Time since the served entry was stored. Only set on hits.
    pub age: Option<Duration>,
}

impl Obtained {
    fn hit(entry: &CacheEntry, now: SystemTime) -> Self {
        Self {
            response: OriginResponse::from(entry),
            status: CacheStatus::Hit,
            age: Some(entry.age(now)),
        }
    }

    fn fetched(fetched: &Fetched, status: CacheStatus) -> Self {
        Self {
            response: fetched.response.clone(),
            status,
            age: None,
        }
    }
}

/// Settings that can be swapped at runtime without dropping cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub freshness: FreshnessPolicy,
    /// Responses with larger bodies are served but never stored.
    pub max_body_size: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            freshness: FreshnessPolicy::default(),
            max_body_size: 1_048_576,
        }
    }
}

/// Result of one origin fetch, shared by every request coalesced onto it.
#[derive(Debug)]
struct Fetched {
    /// Key derived from the fetching request's headers and the response's Vary.
    key: CacheKey,
    vary_names: Vec<String>,
    response: OriginResponse,
}

type FlightOutcome = Result<Arc<Fetched>, CacheError>;
type Flight = Shared<BoxFuture<'static, FlightOutcome>>;

struct InFlight {
    id: u64,
    flight: Flight,
}

enum Admission {
    Hit(Arc<CacheEntry>),
    Join(Flight),
    Lead(Flight),
}

/// Fetch-on-miss orchestration with per-resource request coalescing.
///
/// At most one origin fetch per resource is in flight. The fetch runs as its
/// own task, so a client that disconnects while waiting never cancels it: the
/// response is still evaluated and committed. The in-flight table only holds
/// unresolved fetches; each entry is removed as soon as its fetch finishes,
/// whatever the outcome, so an uncacheable or failed response is retried by
/// the next request.
pub struct Coordinator {
    store: Arc<VariantStore>,
    origin: Arc<dyn Origin>,
    clock: Arc<dyn Clock>,
    policy: ArcSwap<FetchPolicy>,
    cacheable_methods: Vec<Method>,
    in_flight: Mutex<HashMap<ResourceId, InFlight>>,
    next_flight: AtomicU64,
}

impl Coordinator {
    pub fn new(
        store: Arc<VariantStore>,
        origin: Arc<dyn Origin>,
        clock: Arc<dyn Clock>,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            store,
            origin,
            clock,
            policy: ArcSwap::from_pointee(policy),
            cacheable_methods: vec![Method::GET, Method::HEAD],
            in_flight: Mutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    /// Replace the set of methods whose responses may be stored.
    pub fn with_cacheable_methods(mut self, methods: Vec<Method>) -> Self {
        self.cacheable_methods = methods;
        self
    }

    pub fn store(&self) -> &Arc<VariantStore> {
        &self.store
    }

    pub fn policy(&self) -> FetchPolicy {
        **self.policy.load()
    }

    /// Swap the fetch policy. Entries already stored keep their expiry.
    pub fn set_policy(&self, policy: FetchPolicy) {
        self.policy.store(Arc::new(policy));
        tracing::info!(
            default_ttl_secs = policy.freshness.default_ttl.as_secs(),
            max_body_size = policy.max_body_size,
            "fetch policy updated"
        );
    }

    /// Number of origin fetches currently unresolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Produce the response for `request`, from the store when a fresh variant
    /// matches and from the origin otherwise.
    pub async fn obtain(self: &Arc<Self>, request: OriginRequest) -> Result<Obtained, CacheError> {
        if !self.cacheable_methods.contains(&request.method) {
            tracing::debug!(method = %request.method, path = %request.path, "cache BYPASS");
            let response = self.origin.send(request).await?;
            return Ok(Obtained {
                response,
                status: CacheStatus::Bypass,
                age: None,
            });
        }

        let resource = request.resource();

        loop {
            let now = self.clock.now();
            if let Some(entry) = self.store.lookup(&resource, &request.headers, now) {
                tracing::debug!(key = %entry.key, "cache HIT");
                return Ok(Obtained::hit(&entry, now));
            }

            match self.admit(&resource, &request) {
                Admission::Hit(entry) => {
                    tracing::debug!(key = %entry.key, "cache HIT after in-flight fetch");
                    return Ok(Obtained::hit(&entry, self.clock.now()));
                }
                Admission::Lead(flight) => {
                    let fetched = flight.await?;
                    tracing::debug!(key = %fetched.key, "cache MISS, fetched from origin");
                    return Ok(Obtained::fetched(&fetched, CacheStatus::Miss));
                }
                Admission::Join(flight) => {
                    let fetched = flight.await?;
                    let key = CacheKey::derive(&resource, &request.headers, &fetched.vary_names);
                    if key == fetched.key {
                        tracing::debug!(key = %key, "cache MISS coalesced");
                        return Ok(Obtained::fetched(&fetched, CacheStatus::Coalesced));
                    }
                    // Same resource, different variant: go round again now that
                    // the Vary names are known.
                    tracing::debug!(
                        key = %key,
                        fetched = %fetched.key,
                        "coalesced fetch was another variant"
                    );
                }
            }
        }
    }

    /// Join the in-flight fetch for `resource` or start one.
    fn admit(self: &Arc<Self>, resource: &ResourceId, request: &OriginRequest) -> Admission {
        let mut in_flight = self.in_flight.lock();

        if let Some(existing) = in_flight.get(resource) {
            return Admission::Join(existing.flight.clone());
        }

        // A fetch may have committed and left the table since our lookup.
        if let Some(entry) = self.store.lookup(resource, &request.headers, self.clock.now()) {
            return Admission::Hit(entry);
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(Arc::clone(self).run_flight(id, resource.clone(), request.clone()));
        let flight = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(CacheError::OriginUnreachable(OriginError::Aborted(e.to_string()))),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            resource.clone(),
            InFlight {
                id,
                flight: flight.clone(),
            },
        );
        Admission::Lead(flight)
    }

    async fn run_flight(
        self: Arc<Self>,
        id: u64,
        resource: ResourceId,
        request: OriginRequest,
    ) -> FlightOutcome {
        let _guard = FlightGuard {
            coordinator: &self,
            resource: &resource,
            id,
        };
        self.fetch_and_commit(&resource, request).await
    }

    async fn fetch_and_commit(
        &self,
        resource: &ResourceId,
        request: OriginRequest,
    ) -> FlightOutcome {
        let request_headers = request.headers.clone();

        let response = match self.origin.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, resource = %resource, "origin fetch failed");
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let policy = self.policy();
        let verdict = policy.freshness.evaluate(&response.headers, now);
        let vary_names = parse_vary(&response.headers).names().to_vec();
        let key = CacheKey::derive(resource, &request_headers, &vary_names);

        if !verdict.cacheable {
            tracing::debug!(key = %key, status = response.status.as_u16(), "response not cacheable");
        } else if verdict.expires_at <= now {
            tracing::debug!(key = %key, "response already stale, not caching");
        } else if response.body.len() > policy.max_body_size {
            tracing::debug!(
                key = %key,
                size = response.body.len(),
                limit = policy.max_body_size,
                "response body too large to cache"
            );
        } else if let Err(e) = self.store.commit(
            resource,
            &request_headers,
            vary_names.clone(),
            &response,
            now,
            verdict.expires_at,
        ) {
            tracing::warn!(error = %e, key = %key, "failed to commit response, serving it uncached");
        }

        Ok(Arc::new(Fetched {
            key,
            vary_names,
            response,
        }))
    }
}

/// Removes a flight from the in-flight table when its task ends, including
/// on panic.
struct FlightGuard<'a> {
    coordinator: &'a Coordinator,
    resource: &'a ResourceId,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.coordinator.in_flight.lock();
        if in_flight.get(self.resource).is_some_and(|f| f.id == self.id) {
            in_flight.remove(self.resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sharded::ShardedStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::header::CACHE_CONTROL;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::sync::atomic::AtomicUsize;
    use std::time::UNIX_EPOCH;

    struct CountingOrigin {
        calls: AtomicUsize,
        cache_control: Option<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl Origin for CountingOrigin {
        async fn send(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OriginError::Connect("connection refused".into()));
            }
            let mut headers = HeaderMap::new();
            if let Some(cc) = self.cache_control {
                headers.insert(CACHE_CONTROL, HeaderValue::from_static(cc));
            }
            Ok(OriginResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from(request.path_and_query()),
            })
        }
    }

    fn coordinator(origin: Arc<CountingOrigin>) -> Arc<Coordinator> {
        let store = Arc::new(VariantStore::new(Arc::new(ShardedStore::new(1024))));
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));
        Arc::new(Coordinator::new(store, origin, clock, FetchPolicy::default()))
    }

    fn origin(cache_control: Option<&'static str>, fail: bool) -> Arc<CountingOrigin> {
        Arc::new(CountingOrigin {
            calls: AtomicUsize::new(0),
            cache_control,
            fail,
        })
    }

    fn get(path: &str) -> OriginRequest {
        OriginRequest::new(Method::GET, path, None)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let origin = origin(None, false);
        let coord = coordinator(Arc::clone(&origin));

        let first = coord.obtain(get("/a")).await.unwrap();
        let second = coord.obtain(get("/a")).await.unwrap();

        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.response.body, Bytes::from_static(b"/a"));
        assert_eq!(second.age, Some(Duration::ZERO));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coord.in_flight(), 0);
    }

    #[tokio::test]
    async fn non_cacheable_methods_bypass() {
        let origin = origin(None, false);
        let coord = coordinator(Arc::clone(&origin));

        for _ in 0..2 {
            let post = OriginRequest::new(Method::POST, "/a", None);
            let obtained = coord.obtain(post).await.unwrap();
            assert_eq!(obtained.status, CacheStatus::Bypass);
        }
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(coord.store().is_empty());
    }

    #[tokio::test]
    async fn custom_method_set_is_honoured() {
        let origin = origin(None, false);
        let store = Arc::new(VariantStore::new(Arc::new(ShardedStore::new(1024))));
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let coord = Arc::new(
            Coordinator::new(store, origin.clone(), clock, FetchPolicy::default())
                .with_cacheable_methods(vec![Method::GET]),
        );

        let head = OriginRequest::new(Method::HEAD, "/a", None);
        assert_eq!(coord.obtain(head).await.unwrap().status, CacheStatus::Bypass);
    }

    #[tokio::test]
    async fn uncacheable_response_is_refetched() {
        let origin = origin(Some("no-store"), false);
        let coord = coordinator(Arc::clone(&origin));

        coord.obtain(get("/a")).await.unwrap();
        let second = coord.obtain(get("/a")).await.unwrap();

        assert_eq!(second.status, CacheStatus::Miss);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(coord.store().is_empty());
        assert_eq!(coord.in_flight(), 0);
    }

    #[tokio::test]
    async fn stale_on_arrival_is_not_stored() {
        let origin = origin(Some("max-age=0"), false);
        let coord = coordinator(Arc::clone(&origin));

        coord.obtain(get("/a")).await.unwrap();
        let second = coord.obtain(get("/a")).await.unwrap();

        assert_eq!(second.status, CacheStatus::Miss);
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(coord.store().is_empty());
    }

    #[tokio::test]
    async fn origin_failure_is_surfaced_and_not_cached() {
        let origin = origin(None, true);
        let coord = coordinator(Arc::clone(&origin));

        let err = coord.obtain(get("/a")).await.unwrap_err();
        assert!(matches!(err, CacheError::OriginUnreachable(OriginError::Connect(_))));

        coord.obtain(get("/a")).await.unwrap_err();
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
        assert!(coord.store().is_empty());
        assert_eq!(coord.in_flight(), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_served_but_not_stored() {
        let origin = origin(None, false);
        let coord = coordinator(Arc::clone(&origin));
        coord.set_policy(FetchPolicy {
            max_body_size: 2,
            ..FetchPolicy::default()
        });

        let obtained = coord.obtain(get("/large")).await.unwrap();
        assert_eq!(obtained.response.body, Bytes::from_static(b"/large"));
        assert!(coord.store().is_empty());
    }

    #[test]
    fn status_labels() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Coalesced.as_str(), "COALESCED");
    }
}
