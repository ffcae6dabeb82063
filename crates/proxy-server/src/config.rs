use edgestash_cache::{Coordinator, FetchPolicy, FreshnessPolicy};
use hyper::Method;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Freshness for responses without `Cache-Control: max-age` or `Expires`.
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: usize,
    #[serde(default = "default_cacheable_methods")]
    pub cacheable_methods: Vec<String>,
    /// How often expired entries are purged in the background. 0 disables the
    /// sweep; expired entries are then only dropped when a lookup finds them.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
                timeout_ms: default_timeout_ms(),
            },
            cache: CacheConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            freshness: FreshnessPolicy::new(Duration::from_secs(self.default_ttl_seconds)),
            max_body_size: self.max_body_size_bytes,
        }
    }

    /// Parsed cacheable methods. Unknown tokens are logged and skipped.
    pub fn methods(&self) -> Vec<Method> {
        self.cacheable_methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(e) => {
                    tracing::warn!(method = %m, error = %e, "ignoring invalid cacheable method");
                    None
                }
            })
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_ttl_seconds: default_ttl(),
            max_body_size_bytes: default_max_body_size(),
            cacheable_methods: default_cacheable_methods(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - TTL or body size limit changed → fetch policy swapped atomically
/// - Capacity, methods, addresses or upstream changed → WARN log, ignored
pub fn diff_and_apply(old: &Config, new: &Config, coordinator: &Coordinator) {
    if old.cache.capacity != new.cache.capacity {
        tracing::warn!(
            old = old.cache.capacity,
            new = new.cache.capacity,
            "capacity change detected, ignoring. Restart to resize the store"
        );
    }

    if old.cache.cacheable_methods != new.cache.cacheable_methods
        || old.upstream.url != new.upstream.url
        || old.upstream.timeout_ms != new.upstream.timeout_ms
        || old.server.listen_addr != new.server.listen_addr
        || old.server.metrics_addr != new.server.metrics_addr
    {
        tracing::warn!("server, upstream or method changes require a restart, ignoring");
    }

    if old.cache.default_ttl_seconds != new.cache.default_ttl_seconds
        || old.cache.max_body_size_bytes != new.cache.max_body_size_bytes
    {
        coordinator.set_policy(new.cache.fetch_policy());
        tracing::info!(
            old_ttl = old.cache.default_ttl_seconds,
            new_ttl = new.cache.default_ttl_seconds,
            old_max_body = old.cache.max_body_size_bytes,
            new_max_body = new.cache.max_body_size_bytes,
            "config reloaded: fetch policy changed"
        );
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
fn default_capacity() -> usize {
    10000
}
fn default_ttl() -> u64 {
    60
}
fn default_max_body_size() -> usize {
    1_048_576
}
fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}
fn default_sweep_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url = "http://origin:3000"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.url, "http://origin:3000");
        assert_eq!(config.upstream.timeout_ms, 5000);
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.cache.default_ttl_seconds, 60);
        assert_eq!(config.cache.methods(), vec![Method::GET, Method::HEAD]);
    }

    #[test]
    fn cache_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            url = "http://origin:3000"

            [cache]
            capacity = 64
            default_ttl_seconds = 300
            max_body_size_bytes = 10
            cacheable_methods = ["get", "BOGUS METHOD"]
            "#,
        )
        .unwrap();

        let policy = config.cache.fetch_policy();
        assert_eq!(policy.freshness.default_ttl, Duration::from_secs(300));
        assert_eq!(policy.max_body_size, 10);
        assert_eq!(config.cache.methods(), vec![Method::GET]);
        assert_eq!(config.cache.sweep_interval_seconds, 30);
    }

    #[test]
    fn upstream_is_required() {
        assert!(toml::from_str::<Config>("[cache]\ncapacity = 1\n").is_err());
    }
}
