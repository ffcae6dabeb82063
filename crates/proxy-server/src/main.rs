mod admin;
mod config;
mod pipeline;
mod upstream;

use admin::stats_handler;
use axum::routing::{any, get};
use axum::Router;
use config::Config;
use edgestash_cache::{Clock, Coordinator, ShardedStore, SystemClock, VariantStore};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use pipeline::{pipeline_handler, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use upstream::HyperOrigin;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config
    let config = if Path::new("config.toml").exists() {
        match Config::load(Path::new("config.toml")) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(VariantStore::new(Arc::new(ShardedStore::new(
        config.cache.capacity,
    ))));
    let origin = Arc::new(HyperOrigin::new(
        config.upstream.url.clone(),
        Duration::from_millis(config.upstream.timeout_ms),
    ));
    let coordinator = Arc::new(
        Coordinator::new(
            Arc::clone(&store),
            origin,
            Arc::clone(&clock),
            config.cache.fetch_policy(),
        )
        .with_cacheable_methods(config.cache.methods()),
    );

    let state = Arc::new(AppState {
        coordinator: Arc::clone(&coordinator),
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    if config.cache.sweep_interval_seconds > 0 {
        tokio::spawn(expiry_sweeper(
            Arc::clone(&store),
            Arc::clone(&clock),
            Duration::from_secs(config.cache.sweep_interval_seconds),
            shutdown.clone(),
        ));
    }

    // Build admin router (separate port)
    let admin_router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(Arc::clone(&state));

    // Build proxy router (main port)
    let proxy_router = Router::new()
        .route("/{*path}", any(pipeline_handler))
        .route("/", any(pipeline_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let metrics_addr = config.server.metrics_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        metrics = %metrics_addr,
        upstream = %config.upstream.url,
        capacity = config.cache.capacity,
        default_ttl_seconds = config.cache.default_ttl_seconds,
        "edgestash proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .map_err(|e| format!("failed to bind proxy to {proxy_addr}: {e}"))?;

    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .map_err(|e| format!("failed to bind metrics to {metrics_addr}: {e}"))?;

    // Spawn config file watcher
    spawn_config_watcher(PathBuf::from("config.toml"), config, coordinator);

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let proxy_future = axum::serve(proxy_listener, proxy_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let metrics_future = axum::serve(metrics_listener, admin_router)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = metrics_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        }
    }

    tracing::info!("edgestash proxy shut down");
    Ok(())
}

/// Periodically drop expired entries. Lookups already ignore them; this only
/// bounds memory held by entries nobody asks for again.
async fn expiry_sweeper(
    store: Arc<VariantStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match store.sweep_expired(clock.now()) {
                    Ok(0) => {}
                    Ok(dropped) => tracing::debug!(dropped, "swept expired entries"),
                    Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
                }
            }
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Spawn a filesystem watcher on config.toml that applies safe config changes at runtime.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, coordinator: Arc<Coordinator>) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&config_path_clone) {
                    Ok(new_config) => {
                        let mut old = current_config.lock();
                        config::diff_and_apply(&old, &new_config, &coordinator);
                        *old = new_config;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config.toml");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config.toml");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
