//! Error types for the REST client.
//!
//! Defines [`RestError`], returned by every executor and admission
//! operation, and [`ApiError`], the decoded body of a non-success response.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors returned by the REST client
#[derive(Debug, Error)]
pub enum RestError {
    /// The caller's deadline passed or its cancellation token fired while the
    /// request was queued or sleeping on a rate limit. Safe to retry.
    #[error("Admission timed out for {key}")]
    AdmissionTimeout {
        /// Rate-limit key of the abandoned request
        key: String,
    },

    /// Fail-fast mode refused to sleep through a rate limit
    #[error("Rate limited on {key}, retry after {retry_after:?} (global: {global})")]
    RateLimited {
        /// Rate-limit key of the refused request
        key: String,
        /// How long the caller would have had to wait
        retry_after: Duration,
        /// Whether the global limiter is the one in force
        global: bool,
    },

    /// A network-level error occurred
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote service answered with a non-success status
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A success response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The request could not be built (bad path, header value, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RestError {
    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RestError::AdmissionTimeout { .. } | RestError::RateLimited { .. } => true,
            RestError::Transport(e) => e.is_timeout() || e.is_connect(),
            RestError::Api(api) => api.status == 429 || api.status >= 500,
            RestError::Decode(_) | RestError::InvalidRequest(_) => false,
        }
    }
}

/// Structured error body returned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API error {status} (code {code}): {message}")]
pub struct ApiError {
    /// HTTP status of the response
    pub status: u16,
    /// Service-specific JSON error code, `0` when absent
    pub code: u64,
    /// Human-readable message
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: String,
}

impl ApiError {
    /// Decodes a `{code, message}` error body, falling back to the raw text
    /// (or the status reason) when the body is not the expected JSON.
    pub fn from_response(status: reqwest::StatusCode, body: &[u8]) -> Self {
        let (code, message) = match serde_json::from_slice::<ApiErrorBody>(body) {
            Ok(parsed) if !parsed.message.is_empty() => (parsed.code, parsed.message),
            Ok(parsed) => (parsed.code, status_reason(status)),
            Err(_) => {
                let text = String::from_utf8_lossy(body).trim().to_string();
                if text.is_empty() {
                    (0, status_reason(status))
                } else {
                    (0, text)
                }
            }
        };
        Self {
            status: status.as_u16(),
            code,
            message,
        }
    }
}

fn status_reason(status: reqwest::StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("Unknown status")
        .to_string()
}
