//! Rate-limited REST client
//!
//! [`RestClient`] is the only way requests leave the process. Each call is
//! mapped to its rate-limit key, admitted through the bucket the
//! [`RateLimitManager`] assigns to that key, sent with reqwest, and folded
//! back into the bucket state from the response headers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cordwire_core::config::RestConfig;
//! use cordwire_rest::client::{Request, RestClient};
//!
//! # async fn example() -> Result<(), cordwire_rest::RestError> {
//! let client = RestClient::new("bot-token", RestConfig::default())?;
//! let me: serde_json::Value = client.execute_json(Request::get("/users/@me")).await?;
//! println!("Logged in as {}", me["username"]);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use cordwire_core::{
    config::RestConfig,
    ports::{CacheKey, EntityCache},
};
use reqwest::{header::HeaderMap, Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::{
    bucket::{AdmissionContext, RawResponse},
    error::{ApiError, RestError},
    manager::RateLimitManager,
    route::RateLimitKey,
};

/// Header carrying the moderator-supplied reason for audited actions.
const AUDIT_LOG_REASON: &str = "X-Audit-Log-Reason";

// ============================================================================
// Request / RestResponse
// ============================================================================

/// A REST call: method, path relative to the API base URL, optional JSON
/// body and optional audit-log reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub reason: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            reason: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attaches a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attaches an audit-log reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Rate-limit key this request is admitted under.
    pub fn rate_limit_key(&self) -> RateLimitKey {
        RateLimitKey::from_request(&self.method, &self.path)
    }
}

/// A successful (2xx or 304) response.
///
/// Rate-limit headers are in canonical form: see
/// [`headers`](crate::headers) for the field layout.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RestResponse {
    /// Decodes the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        Ok(serde_json::from_value(self.json_value()?)?)
    }

    /// Body as text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn json_value(&self) -> Result<serde_json::Value, RestError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

impl From<RawResponse> for RestResponse {
    fn from(raw: RawResponse) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
        }
    }
}

// ============================================================================
// RestClient
// ============================================================================

/// HTTP client for the REST API with rate-limit admission control.
///
/// Clones share the underlying connection pool and rate-limit state.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    token: String,
    config: RestConfig,
    limiter: Arc<RateLimitManager>,
    cache: Option<Arc<dyn EntityCache>>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("limiter", &self.limiter)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl RestClient {
    /// Creates a client authenticating with a bot `token`.
    ///
    /// An empty token sends no `Authorization` header, which is what
    /// webhook-only use needs.
    ///
    /// `config` is taken as is; run [`Config::validate`] first to reject bad
    /// values. With `fail_fast` set and `timeout_secs == 0` there is no wait
    /// budget, so every rate-limit wait fails with [`RestError::RateLimited`].
    ///
    /// [`Config::validate`]: cordwire_core::config::Config::validate
    pub fn new(token: impl Into<String>, config: RestConfig) -> Result<Self, RestError> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            limiter: RateLimitManager::new(&config),
            config,
            cache: None,
        })
    }

    /// Creates a client against a custom base URL (useful for testing)
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, RestError> {
        let config = RestConfig {
            base_url: base_url.into(),
            ..RestConfig::default()
        };
        Self::new(token, config)
    }

    /// Shares an existing rate-limit manager, e.g. between clients that use
    /// the same token.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimitManager>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Hands decoded entities from [`execute_json`](Self::execute_json) to
    /// `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimitManager> {
        &self.limiter
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    /// Admission context built from the configured timeout and fail-fast
    /// policy.
    pub fn default_context(&self) -> AdmissionContext {
        let ctx = AdmissionContext::new().with_fail_fast(self.config.fail_fast);
        match self.config.timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Sends `request` under the configured timeout.
    pub async fn execute(&self, request: Request) -> Result<RestResponse, RestError> {
        self.execute_with(request, &self.default_context()).await
    }

    /// Sends `request` under a caller-supplied deadline and cancellation
    /// token.
    ///
    /// Any status other than 2xx or 304 is returned as [`RestError::Api`];
    /// a 429 is reported, never retried.
    pub async fn execute_with(
        &self,
        request: Request,
        ctx: &AdmissionContext,
    ) -> Result<RestResponse, RestError> {
        let key = request.rate_limit_key();
        let builder = self.build(&request)?;
        let bucket = self.limiter.bucket(&key);

        let raw = bucket
            .transaction(ctx, || async move {
                let response = builder.send().await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await?.to_vec();
                Ok::<_, RestError>(RawResponse::new(status, headers, body))
            })
            .await?;

        debug!(key = %key, status = raw.status.as_u16(), bytes = raw.body.len(), "Request completed");

        if raw.status.is_success() || raw.status == StatusCode::NOT_MODIFIED {
            Ok(raw.into())
        } else {
            Err(ApiError::from_response(raw.status, &raw.body).into())
        }
    }

    /// Sends `request` and decodes the JSON body into `T`.
    ///
    /// The decoded entity is handed to the cache, if one is configured; a
    /// successful DELETE evicts the path instead. Cache failures are logged
    /// and do not fail the call.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T, RestError> {
        let cache_key = CacheKey::new(request.method.as_str(), strip_query(&request.path));
        let response = self.execute(request).await?;
        let value = response.json_value()?;

        if let Some(cache) = &self.cache {
            let result = if cache_key.method == Method::DELETE.as_str() {
                cache.evict(&cache_key).await
            } else if value.is_null() {
                Ok(())
            } else {
                cache.store(cache_key.clone(), value.clone()).await
            };
            if let Err(e) = result {
                warn!(entity = %cache_key, error = %e, "Entity cache update failed");
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Builds the reqwest request: URL, auth, JSON body, audit-log reason.
    fn build(&self, request: &Request) -> Result<RequestBuilder, RestError> {
        let url = self.url(&request.path)?;
        let mut builder = self.http.request(request.method.clone(), url);

        if !self.token.is_empty() {
            builder = builder.header(
                reqwest::header::AUTHORIZATION,
                format!("Bot {}", self.token),
            );
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(reason) = &request.reason {
            builder = builder.header(AUDIT_LOG_REASON, encode_reason(reason));
        }
        Ok(builder)
    }

    fn url(&self, path: &str) -> Result<Url, RestError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| RestError::InvalidRequest(format!("{path}: {e}")))
    }
}

/// Percent-encodes an audit-log reason so any Unicode text survives as a
/// header value.
fn encode_reason(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn strip_query(path: &str) -> &str {
    path.split(&['?', '#'][..]).next().unwrap_or_default()
}
