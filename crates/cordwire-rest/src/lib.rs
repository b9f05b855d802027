//! Cordwire REST - rate-limited HTTP client for the Discord REST API
//!
//! Every REST call passes through an admission-control pipeline that
//! enforces the remote service's dynamically discovered rate-limit buckets:
//! - Route keys derived from method and templatized path
//! - Per-bucket FIFO admission with a non-blocking "call in flight" token
//! - A single global limiter that supersedes every route bucket
//! - Bucket consolidation once the server reveals two routes share a bucket
//! - Header normalization with clock-skew compensation
//!
//! ## Modules
//!
//! - [`route`] - rate-limit key derivation
//! - [`headers`] - rate-limit header normalization
//! - [`ticket`] - FIFO admission tickets
//! - [`bucket`] - per-bucket state and the admission transaction
//! - [`manager`] - key-to-bucket mapping, consolidation and the global bucket
//! - [`client`] - the request executor built on reqwest
//! - [`error`] - error types

pub mod bucket;
pub mod client;
pub mod error;
pub mod headers;
pub mod manager;
pub mod route;
pub mod ticket;

pub use bucket::{AdmissionContext, Bucket, BucketState, RawResponse};
pub use client::{Request, RestClient, RestResponse};
pub use error::{ApiError, RestError};
pub use manager::RateLimitManager;
pub use route::RateLimitKey;
