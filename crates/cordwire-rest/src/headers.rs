//! Rate-limit header normalization
//!
//! The remote service reports rate-limit state through a mix of headers with
//! different units: an absolute reset timestamp in fractional seconds, a
//! relative reset delay in fractional seconds, a `Retry-After` in seconds
//! and, on 429 responses, a JSON body that may carry the retry delay instead
//! of the headers. This module folds all of them into one canonical,
//! millisecond-based [`NormalizedHeaders`].
//!
//! ## Clock skew
//!
//! Relative delays are preferred over the absolute reset timestamp, and are
//! added to the server's own `Date` header when it parses. Without a `Date`
//! header the local wall clock is used instead.
//!
//! ## Idempotence
//!
//! [`NormalizedHeaders::write_canonical`] rewrites a header map into the
//! canonical form and tags it with [`NORMALIZED_MARKER`]. Normalizing a tagged
//! map reads the canonical values back untouched, so a response can safely
//! be normalized more than once.

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, DATE, RETRY_AFTER},
    StatusCode,
};
use serde::Deserialize;
use tracing::warn;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATELIMIT_RESET_AFTER: HeaderName = HeaderName::from_static("x-ratelimit-reset-after");
pub const RATELIMIT_BUCKET: HeaderName = HeaderName::from_static("x-ratelimit-bucket");
pub const RATELIMIT_GLOBAL: HeaderName = HeaderName::from_static("x-ratelimit-global");

/// Marks a header map as already normalized. In canonical form
/// `X-RateLimit-Reset` holds absolute epoch milliseconds.
pub const NORMALIZED_MARKER: HeaderName = HeaderName::from_static("x-cordwire-normalized");

/// Canonical carrier for the relative delay that produced the reset deadline.
pub const RETRY_AFTER_MS: HeaderName = HeaderName::from_static("x-cordwire-retry-after-ms");

// ============================================================================
// Normalized form
// ============================================================================

/// What the response said about the bucket hash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BucketHash {
    /// Header missing; keep whatever the bucket already knows.
    #[default]
    Absent,
    /// Header present but empty: an anonymous or global bucket.
    Anonymous,
    /// Server-assigned bucket identifier.
    Known(String),
}

/// Rate-limit information of one response in canonical units.
///
/// Every field is optional in the sense that `None` means "the response did
/// not say (or said something unparsable); keep the previous value".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedHeaders {
    /// Requests allowed per window.
    pub limit: Option<u32>,
    /// Requests left in the current window.
    pub remaining: Option<u32>,
    /// Absolute reset deadline, epoch milliseconds.
    pub reset_at_ms: Option<u64>,
    /// Relative delay the deadline was derived from, if any.
    pub retry_after_ms: Option<u64>,
    pub bucket_hash: BucketHash,
    /// The limit hit is the global one rather than the route's.
    pub is_global: bool,
}

/// Body of a 429 response.
#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    message: String,
    /// Seconds, possibly fractional.
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

// ============================================================================
// normalize()
// ============================================================================

/// Parses the rate-limit headers (and, for 429s, the body) of a response.
///
/// `now_ms` is the local wall clock in epoch milliseconds, used only when the
/// response carries no parsable `Date` header.
pub fn normalize(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    now_ms: u64,
) -> NormalizedHeaders {
    if headers.contains_key(NORMALIZED_MARKER) {
        return read_canonical(headers);
    }

    let limit = parse_header::<u32>(headers, &RATELIMIT_LIMIT);
    let mut remaining = parse_header::<u32>(headers, &RATELIMIT_REMAINING);

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS;
    let body = if rate_limited {
        parse_body(body)
    } else {
        None
    };

    // A 429 without a remaining count still means the window is exhausted.
    if rate_limited && remaining.is_none() {
        remaining = Some(0);
    }

    let retry_after_ms = parse_seconds(headers, &RETRY_AFTER)
        .or_else(|| body.as_ref().and_then(|b| b.retry_after).and_then(seconds_to_ms))
        .or_else(|| parse_seconds(headers, &RATELIMIT_RESET_AFTER));

    let reset_at_ms = match retry_after_ms {
        Some(delay) => Some(server_now_ms(headers).unwrap_or(now_ms).saturating_add(delay)),
        None => parse_seconds(headers, &RATELIMIT_RESET),
    };

    let is_global = header_str(headers, &RATELIMIT_GLOBAL)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
        || body.as_ref().map(|b| b.global).unwrap_or(false);

    let bucket_hash = match header_str(headers, &RATELIMIT_BUCKET) {
        None => BucketHash::Absent,
        Some("") => BucketHash::Anonymous,
        Some(hash) => BucketHash::Known(hash.to_string()),
    };

    NormalizedHeaders {
        limit,
        remaining,
        reset_at_ms,
        retry_after_ms,
        bucket_hash,
        is_global,
    }
}

impl NormalizedHeaders {
    /// Rewrites `headers` into canonical form and tags it as normalized.
    ///
    /// Relative delay headers are removed; `X-RateLimit-Reset` becomes an
    /// absolute epoch-millisecond value.
    pub fn write_canonical(&self, headers: &mut HeaderMap) {
        headers.remove(RETRY_AFTER);
        headers.remove(RATELIMIT_RESET_AFTER);

        set_or_remove(headers, RATELIMIT_LIMIT, self.limit.map(HeaderValue::from));
        set_or_remove(headers, RATELIMIT_REMAINING, self.remaining.map(HeaderValue::from));
        set_or_remove(headers, RATELIMIT_RESET, self.reset_at_ms.map(HeaderValue::from));
        set_or_remove(headers, RETRY_AFTER_MS, self.retry_after_ms.map(HeaderValue::from));
        set_or_remove(
            headers,
            RATELIMIT_GLOBAL,
            self.is_global.then(|| HeaderValue::from_static("true")),
        );

        let hash = match &self.bucket_hash {
            BucketHash::Absent => None,
            BucketHash::Anonymous => Some(HeaderValue::from_static("")),
            BucketHash::Known(hash) => HeaderValue::from_str(hash).ok(),
        };
        set_or_remove(headers, RATELIMIT_BUCKET, hash);

        headers.insert(NORMALIZED_MARKER, HeaderValue::from_static("1"));
    }
}

fn read_canonical(headers: &HeaderMap) -> NormalizedHeaders {
    NormalizedHeaders {
        limit: parse_header(headers, &RATELIMIT_LIMIT),
        remaining: parse_header(headers, &RATELIMIT_REMAINING),
        reset_at_ms: parse_header(headers, &RATELIMIT_RESET),
        retry_after_ms: parse_header(headers, &RETRY_AFTER_MS),
        bucket_hash: match header_str(headers, &RATELIMIT_BUCKET) {
            None => BucketHash::Absent,
            Some("") => BucketHash::Anonymous,
            Some(hash) => BucketHash::Known(hash.to_string()),
        },
        is_global: header_str(headers, &RATELIMIT_GLOBAL) == Some("true"),
    }
}

// ============================================================================
// Field parsing helpers
// ============================================================================

fn set_or_remove(headers: &mut HeaderMap, name: HeaderName, value: Option<HeaderValue>) {
    match value {
        Some(value) => {
            headers.insert(name, value);
        }
        None => {
            headers.remove(name);
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_header<T: std::str::FromStr>(headers: &HeaderMap, name: &HeaderName) -> Option<T> {
    let raw = header_str(headers, name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(header = %name, value = raw, "Ignoring unparsable rate-limit header");
            None
        }
    }
}

/// Parses a (possibly fractional) seconds header into whole milliseconds.
fn parse_seconds(headers: &HeaderMap, name: &HeaderName) -> Option<u64> {
    let raw = header_str(headers, name)?;
    let parsed = raw.parse::<f64>().ok().and_then(seconds_to_ms);
    if parsed.is_none() {
        warn!(header = %name, value = raw, "Ignoring unparsable rate-limit header");
    }
    parsed
}

/// Rounds up so a deadline is never reported earlier than the server meant.
fn seconds_to_ms(seconds: f64) -> Option<u64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let ms = (seconds * 1000.0).ceil();
    (ms <= u64::MAX as f64).then_some(ms as u64)
}

/// The server's notion of "now" from the `Date` header, epoch milliseconds.
fn server_now_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = header_str(headers, &DATE)?;
    let date = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    u64::try_from(date.timestamp_millis()).ok()
}

fn parse_body(body: &[u8]) -> Option<RateLimitedBody> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<RateLimitedBody>(body) {
        Ok(parsed) => {
            warn!(
                message = %parsed.message,
                retry_after = ?parsed.retry_after,
                global = parsed.global,
                "Rate limited by remote service"
            );
            Some(parsed)
        }
        Err(e) => {
            warn!(error = %e, "Could not decode 429 response body");
            None
        }
    }
}
