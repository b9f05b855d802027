//! Integration tests for rate-limit admission over real HTTP.
//!
//! The mock server stamps a `Date` header with one-second resolution, so
//! every timing assertion leaves a second of slack.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use cordwire_core::config::RestConfig;
use cordwire_rest::{AdmissionContext, Request, RestError};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use crate::common;

#[tokio::test]
async fn test_exhausted_bucket_waits_for_reset() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/channels/1/messages"))
        .respond_with(common::limited(0, "2", "h-wait"))
        .expect(2)
        .mount(&server)
        .await;

    client.execute(Request::get("/channels/1/messages")).await.unwrap();

    let started = Instant::now();
    client.execute(Request::get("/channels/1/messages")).await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "second call went out after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_other_major_parameter_is_not_blocked() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/channels/1/messages"))
        .respond_with(common::limited(0, "30", "h-one"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/2/messages"))
        .respond_with(common::limited(4, "30", "h-two"))
        .mount(&server)
        .await;

    client.execute(Request::get("/channels/1/messages")).await.unwrap();

    let started = Instant::now();
    client.execute(Request::get("/channels/2/messages")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_shared_hash_consolidates_routes() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(common::limited(4, "10", "shared"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me/guilds"))
        .respond_with(common::limited(3, "10", "shared"))
        .mount(&server)
        .await;

    let first = Request::get("/users/@me");
    let second = Request::get("/users/@me/guilds");
    let (k1, k2) = (first.rate_limit_key(), second.rate_limit_key());

    client.execute(first).await.unwrap();
    client.execute(second).await.unwrap();

    let limiter = client.rate_limiter();
    assert!(Arc::ptr_eq(&limiter.bucket(&k1), &limiter.bucket(&k2)));
    assert_eq!(limiter.key_count(), 2);
    assert_eq!(limiter.bucket(&k1).snapshot().hash.as_deref(), Some("shared"));
}

#[tokio::test]
async fn test_global_429_gates_other_routes() {
    let (server, client) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/channels/1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "message": "You are being rate limited.",
            "retry_after": 2.0,
            "global": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/5/roles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;

    match client.execute(Request::post("/channels/1/messages")).await {
        Err(RestError::Api(api)) => assert_eq!(api.status, 429),
        other => panic!("expected 429, got {other:?}"),
    }

    let global = client.rate_limiter().global();
    assert_eq!(global.snapshot().remaining, Some(0));

    let started = Instant::now();
    client.execute(Request::get("/guilds/5/roles")).await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "global limit was not honored: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_fail_fast_returns_rate_limited_without_sending() {
    let config = RestConfig {
        timeout_secs: 2,
        fail_fast: true,
        ..RestConfig::default()
    };
    let (server, client) = common::setup_with(config).await;

    Mock::given(method("GET"))
        .and(path("/channels/9/pins"))
        .respond_with(common::limited(0, "60", "h-pins"))
        .expect(1)
        .mount(&server)
        .await;

    client.execute(Request::get("/channels/9/pins")).await.unwrap();

    match client.execute(Request::get("/channels/9/pins")).await {
        Err(err @ RestError::RateLimited { .. }) => {
            assert!(err.is_retryable());
            if let RestError::RateLimited {
                retry_after, global, ..
            } = err
            {
                assert!(retry_after > Duration::from_secs(50));
                assert!(!global);
            }
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_abandons_wait() {
    let config = RestConfig {
        timeout_secs: 1,
        ..RestConfig::default()
    };
    let (server, client) = common::setup_with(config).await;

    Mock::given(method("GET"))
        .and(path("/channels/9/pins"))
        .respond_with(common::limited(0, "60", "h-pins"))
        .expect(1)
        .mount(&server)
        .await;

    client.execute(Request::get("/channels/9/pins")).await.unwrap();

    let result = client.execute(Request::get("/channels/9/pins")).await;
    assert!(
        matches!(result, Err(RestError::AdmissionTimeout { .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn test_caller_cancellation_abandons_wait() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/channels/9/pins"))
        .respond_with(common::limited(0, "60", "h-pins"))
        .expect(1)
        .mount(&server)
        .await;

    client.execute(Request::get("/channels/9/pins")).await.unwrap();

    let token = CancellationToken::new();
    let ctx = AdmissionContext::new().with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let result = client
        .execute_with(Request::get("/channels/9/pins"), &ctx)
        .await;
    canceller.await.unwrap();

    assert!(
        matches!(result, Err(RestError::AdmissionTimeout { .. })),
        "{result:?}"
    );
}
