use async_trait::async_trait;
use bytes::Bytes;
use edgestash_cache::{Origin, OriginError, OriginRequest, OriginResponse};
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Origin reached over HTTP through a pooled hyper client.
pub struct HyperOrigin {
    client: HttpClient,
    upstream_url: String,
    timeout: Duration,
}

impl HyperOrigin {
    pub fn new(upstream_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            upstream_url: upstream_url.into(),
            timeout,
        }
    }

    fn build_request(&self, request: OriginRequest) -> Result<Request<Full<Bytes>>, OriginError> {
        let uri = format!(
            "{}{}",
            self.upstream_url.trim_end_matches('/'),
            request.path_and_query()
        );

        let mut builder = Request::builder().method(request.method).uri(&uri);
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name) || *name == HOST {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder
            .body(Full::new(request.body))
            .map_err(|e| OriginError::InvalidRequest(e.to_string()))
    }

    async fn round_trip(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<OriginResponse, OriginError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| OriginError::Connect(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| OriginError::Body(e.to_string()))?
            .to_bytes();

        Ok(OriginResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[async_trait]
impl Origin for HyperOrigin {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, OriginError> {
        let path = request.path_and_query();
        let upstream_req = self.build_request(request)?;
        metrics::counter!("edgestash_origin_fetches_total").increment(1);

        match tokio::time::timeout(self.timeout, self.round_trip(upstream_req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::error!(
                    error = %e,
                    upstream = %self.upstream_url,
                    path = %path,
                    "upstream request failed"
                );
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    upstream = %self.upstream_url,
                    path = %path,
                    "upstream request timed out"
                );
                Err(OriginError::Timeout(self.timeout))
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    *name == CONNECTION
        || *name == TRANSFER_ENCODING
        || *name == UPGRADE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}
