use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderValue, AGE, CONNECTION, TRANSFER_ENCODING};
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use edgestash_cache::{CacheError, Coordinator, Obtained, OriginRequest};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Main proxy handler: hand the request to the coordinator and write back
/// whatever it produced.
pub async fn pipeline_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read client request body");
            return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        }
    };

    let request = OriginRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        body,
    };
    let resource = request.resource();

    match state.coordinator.obtain(request).await {
        Ok(obtained) => {
            let status = obtained.status.as_str();
            metrics::counter!("edgestash_requests_total", "cache" => status).increment(1);
            tracing::debug!(
                resource = %resource,
                cache = status,
                status = obtained.response.status.as_u16(),
                latency_us = start.elapsed().as_micros() as u64,
                "request served"
            );
            build_response(obtained)
        }
        Err(e) => {
            metrics::counter!("edgestash_origin_errors_total").increment(1);
            tracing::error!(error = %e, resource = %resource, "request failed");
            error_response(&e)
        }
    }
}

/// Build the client response from the coordinator's result.
fn build_response(obtained: Obtained) -> Response<Body> {
    let Obtained {
        response: upstream,
        status,
        age,
    } = obtained;

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;

    let headers = response.headers_mut();
    for (name, value) in upstream.headers.iter() {
        // Skip hop-by-hop headers
        if *name == CONNECTION || *name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert("x-cache", HeaderValue::from_static(status.as_str()));
    if let Some(age) = age {
        headers.insert(AGE, HeaderValue::from(age.as_secs()));
    }

    response
}

fn error_response(error: &CacheError) -> Response<Body> {
    match error {
        CacheError::OriginUnreachable(_) => (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response(),
        CacheError::StoreUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::routing::any;
    use axum::Router;
    use bytes::Bytes;
    use edgestash_cache::{
        FetchPolicy, ManualClock, Origin, OriginError, OriginResponse, ShardedStore, VariantStore,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, UNIX_EPOCH};
    use tower::ServiceExt;

    struct EchoOrigin {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Origin for EchoOrigin {
        async fn send(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OriginError::Connect("refused".into()));
            }
            let mut headers = axum::http::HeaderMap::new();
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
            headers.insert(
                "request-path",
                HeaderValue::from_str(&request.path).unwrap(),
            );
            Ok(OriginResponse {
                status: StatusCode::NOT_FOUND,
                headers,
                body: Bytes::from(request.path_and_query()),
            })
        }
    }

    fn app(fail: bool) -> (Router, Arc<EchoOrigin>, Arc<ManualClock>) {
        let origin = Arc::new(EchoOrigin {
            calls: AtomicUsize::new(0),
            fail,
        });
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));
        let store = Arc::new(VariantStore::new(Arc::new(ShardedStore::new(1024))));
        let coordinator = Arc::new(Coordinator::new(
            store,
            origin.clone(),
            clock.clone(),
            FetchPolicy::default(),
        ));
        let router = Router::new()
            .route("/{*path}", any(pipeline_handler))
            .route("/", any(pipeline_handler))
            .with_state(Arc::new(AppState { coordinator }));
        (router, origin, clock)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (router, origin, clock) = app(false);

        let first = router.clone().oneshot(get("/Items?id=1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert!(first.headers().get(CONNECTION).is_none());

        clock.advance(Duration::from_secs(3));
        let second = router.oneshot(get("/Items?id=1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::NOT_FOUND);
        assert_eq!(second.headers()["x-cache"], "HIT");
        assert_eq!(second.headers()[AGE], "3");
        assert_eq!(second.headers()["request-path"], "/Items");

        let body = second.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"/Items?id=1"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_bypasses_cache() {
        let (router, origin, _) = app(false);

        for _ in 0..2 {
            let req = Request::builder()
                .method("POST")
                .uri("/submit")
                .body(Body::from("payload"))
                .unwrap();
            let response = router.clone().oneshot(req).await.unwrap();
            assert_eq!(response.headers()["x-cache"], "BYPASS");
        }
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn origin_failure_is_bad_gateway() {
        let (router, _, _) = app(true);
        let response = router.oneshot(get("/down")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
