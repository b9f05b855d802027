//! Rate-limit key derivation
//!
//! The remote service never publishes which bucket a route belongs to, so
//! the client starts from a best guess: the HTTP method plus the request path
//! with every snowflake id replaced by a placeholder. Routes under a "major"
//! resource (channel, guild, webhook) are partitioned per resource, so the
//! first id in those paths is kept verbatim.
//!
//! ## Usage
//!
//! ```rust
//! use cordwire_rest::route::RateLimitKey;
//! use reqwest::Method;
//!
//! let key = RateLimitKey::from_request(&Method::GET, "/channels/123/messages/456");
//! assert_eq!(key.as_str(), "GET:/channels/123/messages/{id}");
//! ```

use reqwest::Method;

/// Path prefixes whose first numeric segment is a major parameter.
const MAJOR_PREFIXES: &[&str] = &["/channels/", "/guilds/", "/webhooks/"];

/// Placeholder substituted for minor numeric path segments.
const ID_PLACEHOLDER: &str = "{id}";

/// Logical rate-limit partition of a request: `METHOD:templatized-path`.
///
/// Two requests with the same key are assumed to share a bucket until the
/// server reveals otherwise through the bucket hash header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey {
    key: String,
}

impl RateLimitKey {
    /// Derives the key for a request.
    ///
    /// Query strings, fragments and a trailing slash are ignored. Numeric
    /// segments become `{id}` except the major parameter.
    pub fn from_request(method: &Method, path: &str) -> Self {
        let path = path.split(&['?', '#'][..]).next().unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let path = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        let mut keep_major = has_major_prefix(path);

        let templated: Vec<&str> = path
            .split('/')
            .map(|segment| {
                if !is_id(segment) {
                    segment
                } else if keep_major {
                    keep_major = false;
                    segment
                } else {
                    ID_PLACEHOLDER
                }
            })
            .collect();

        Self {
            key: format!("{}:{}", method.as_str().to_ascii_uppercase(), templated.join("/")),
        }
    }

    /// Wraps an already-derived key string, e.g. one read back from logs.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The major parameter kept in the key, if the route has one.
    pub fn major_parameter(&self) -> Option<&str> {
        let (_, path) = self.key.split_once(':')?;
        if !has_major_prefix(path) {
            return None;
        }
        path.split('/').find(|segment| is_id(segment))
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

fn has_major_prefix(path: &str) -> bool {
    MAJOR_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn is_id(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}
