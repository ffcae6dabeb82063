use crate::pipeline::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use edgestash_cache::CacheStats;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct StoreMetrics {
    pub backend: String,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
}

impl StoreMetrics {
    fn from_stats(backend: &str, stats: CacheStats) -> Self {
        let total = stats.hits + stats.misses;
        StoreMetrics {
            backend: backend.to_string(),
            hit_rate: if total > 0 {
                stats.hits as f64 / total as f64
            } else {
                0.0
            },
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            size: stats.current_size,
            capacity: stats.capacity,
        }
    }
}

/// GET /api/stats: store counters and the live fetch policy.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let store = coordinator.store();
    let policy = coordinator.policy();

    Json(serde_json::json!({
        "store": StoreMetrics::from_stats(store.backend_name(), store.stats()),
        "in_flight": coordinator.in_flight(),
        "default_ttl_seconds": policy.freshness.default_ttl.as_secs(),
        "max_body_size_bytes": policy.max_body_size,
    }))
}
