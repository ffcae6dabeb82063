use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, EXPIRES, VARY};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

/// Counts every request the origin has answered, so repeated hits through the
/// proxy show up as a stalled counter.
#[derive(Default)]
struct Origin {
    hits: AtomicU64,
}

/// Reflect the request back as response headers.
///
/// Control headers:
/// - `X-Demo-Status`: status code to answer with (default 200)
/// - `X-Demo-Max-Age`: emit `Cache-Control: max-age=<n>`
/// - `X-Demo-Expires-In`: emit `Expires` this many seconds from now
/// - `X-Demo-Vary`: comma-separated header names to emit as `Vary`; each one
///   is echoed back as `Reflected-<name>`
async fn reflect(State(origin): State<Arc<Origin>>, uri: Uri, headers: HeaderMap) -> Response {
    // Simulate upstream latency (5-20ms)
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;

    let hits = origin.hits.fetch_add(1, Ordering::Relaxed) + 1;
    let status = header_str(&headers, "x-demo-status")
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    let mut out = HeaderMap::new();
    insert(&mut out, "request-path", uri.path());
    insert(&mut out, "request-rawquery", uri.query().unwrap_or(""));
    out.insert("x-origin-hits", HeaderValue::from(hits));

    if let Some(max_age) = header_str(&headers, "x-demo-max-age") {
        insert(&mut out, CACHE_CONTROL.as_str(), &format!("max-age={max_age}"));
    }

    if let Some(secs) = header_str(&headers, "x-demo-expires-in").and_then(|s| s.parse().ok()) {
        let at = SystemTime::now() + Duration::from_secs(secs);
        insert(&mut out, EXPIRES.as_str(), &httpdate::fmt_http_date(at));
    }

    if let Some(vary) = header_str(&headers, "x-demo-vary") {
        insert(&mut out, VARY.as_str(), vary);
        for name in vary.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let value = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            insert(&mut out, &format!("reflected-{name}"), &value);
        }
    }

    tracing::info!(
        path = %uri,
        status = status.as_u16(),
        hits,
        latency_ms = delay,
        "origin request"
    );

    (status, out, format!("{uri}\n")).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
        HeaderValue::from_str(value),
    ) else {
        tracing::warn!(name, "skipping header that cannot be reflected");
        return;
    };
    headers.insert(name, value);
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/health", get(health))
        .fallback(reflect)
        .with_state(Arc::new(Origin::default()));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo origin starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
