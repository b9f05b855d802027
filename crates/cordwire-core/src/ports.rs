//! Entity cache port (driven/secondary port)
//!
//! The REST client hands every successfully decoded response body to an
//! optional cache so higher layers can serve repeated lookups without a
//! round-trip. The cache only ever receives data; it has no way to read or
//! modify rate-limit state.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage failures are adapter-specific.
//! - Uses `#[async_trait]` for async trait methods.
//! - A failing cache never fails the request that produced the entity; the
//!   REST client logs the error and carries on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies where a cached entity came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// HTTP method of the originating request, upper-case.
    pub method: String,
    /// Concrete request path, e.g. `/channels/123/messages/456`.
    pub path: String,
}

impl CacheKey {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Receives decoded API entities after successful requests.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Stores (or refreshes) the entity decoded from a successful response.
    async fn store(&self, key: CacheKey, entity: serde_json::Value) -> anyhow::Result<()>;

    /// Drops whatever is cached for `key`, e.g. after a DELETE.
    async fn evict(&self, key: &CacheKey) -> anyhow::Result<()>;
}
