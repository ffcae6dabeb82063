use crate::key::ResourceId;
use crate::traits::CacheEntry;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;

/// A client request as forwarded to the origin, unmodified.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginRequest {
    pub fn new(method: Method, path: impl Into<String>, raw_query: Option<String>) -> Self {
        Self {
            method,
            path: path.into(),
            raw_query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn resource(&self) -> ResourceId {
        ResourceId::new(self.method.clone(), self.path.clone(), self.raw_query.clone())
    }

    pub fn path_and_query(&self) -> String {
        match &self.raw_query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl From<&CacheEntry> for OriginResponse {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OriginError {
    #[error("origin connection failed: {0}")]
    Connect(String),
    #[error("origin did not answer within {0:?}")]
    Timeout(Duration),
    #[error("could not build origin request: {0}")]
    InvalidRequest(String),
    #[error("failed to read origin response body: {0}")]
    Body(String),
    #[error("origin fetch aborted: {0}")]
    Aborted(String),
}

/// Capability to send a request to the origin server.
///
/// Retries and timeouts belong to the implementation; the cache surfaces any
/// error unchanged.
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    async fn send(&self, request: OriginRequest) -> Result<OriginResponse, OriginError>;
}
