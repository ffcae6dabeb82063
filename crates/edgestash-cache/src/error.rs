use crate::origin::OriginError;
use crate::traits::StoreError;

/// Failures scoped to the request (or coalesced requests) that hit them.
///
/// Malformed freshness headers are never an error; they fall back to the
/// default lifetime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The origin could not be reached or failed mid-response. Nothing is
    /// committed.
    #[error("origin unreachable: {0}")]
    OriginUnreachable(#[from] OriginError),
    /// The backing store rejected a write. The coordinator logs this and still
    /// serves the fetched response.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}
