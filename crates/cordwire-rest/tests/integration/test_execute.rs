//! Integration tests for request execution: request shape, response
//! decoding, API errors and the entity cache hook.

use std::sync::Arc;

use cordwire_core::{config::RestConfig, ports::CacheKey};
use cordwire_rest::{headers, Request, RestClient, RestError};
use serde::Deserialize;
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, ResponseTemplate,
};

use crate::common::{self, BrokenCache, RecordingCache};

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: String,
    username: String,
}

#[tokio::test]
async fn test_get_sends_auth_and_decodes_json() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .and(header("Authorization", "Bot test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "80351110224678912",
            "username": "nelly"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let user: User = client
        .execute_json(Request::get("/users/@me"))
        .await
        .expect("execute_json failed");

    assert_eq!(
        user,
        User {
            id: "80351110224678912".into(),
            username: "nelly".into()
        }
    );
}

#[tokio::test]
async fn test_post_sends_json_body_and_reason() {
    let (server, client) = common::setup().await;

    Mock::given(method("POST"))
        .and(path("/channels/41771983423143937/messages"))
        .and(body_json(serde_json::json!({"content": "hello"})))
        .and(header("X-Audit-Log-Reason", "routine%20cleanup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "1"})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client
        .execute(
            Request::post("/channels/41771983423143937/messages")
                .json(serde_json::json!({"content": "hello"}))
                .reason("routine cleanup"),
        )
        .await
        .expect("execute failed");

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.json::<serde_json::Value>().unwrap()["id"], "1");
}

#[tokio::test]
async fn test_error_status_is_decoded_into_api_error() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/channels/1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
            "message": "Unknown Channel",
            "code": 10003
        })))
        .mount(&server)
        .await;

    match client.execute(Request::get("/channels/1")).await {
        Err(RestError::Api(api)) => {
            assert_eq!(api.status, 404);
            assert_eq!(api.code, 10003);
            assert_eq!(api.message, "Unknown Channel");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_content_is_success() {
    let (server, client) = common::setup().await;

    Mock::given(method("DELETE"))
        .and(path("/channels/1/messages/2"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let client = client.with_cache(cache.clone());

    client
        .execute_json::<()>(Request::delete("/channels/1/messages/2"))
        .await
        .expect("204 should decode as unit");

    assert_eq!(
        cache.evicted.lock().unwrap().as_slice(),
        &[CacheKey::new("DELETE", "/channels/1/messages/2")]
    );
}

#[tokio::test]
async fn test_decoded_entity_is_stored_in_cache() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/guilds/197038439483310086"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "197038439483310086",
            "name": "Test Guild"
        })))
        .mount(&server)
        .await;

    let cache = Arc::new(RecordingCache::default());
    let client = client.with_cache(cache.clone());

    let _: serde_json::Value = client
        .execute_json(Request::get("/guilds/197038439483310086?with_counts=true"))
        .await
        .unwrap();

    let entries = cache.entries.lock().unwrap();
    let stored = entries
        .get(&CacheKey::new("GET", "/guilds/197038439483310086"))
        .expect("entity should be cached under its path");
    assert_eq!(stored["name"], "Test Guild");
}

#[tokio::test]
async fn test_cache_failure_does_not_fail_request() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "1",
            "username": "x"
        })))
        .mount(&server)
        .await;

    let client = client.with_cache(Arc::new(BrokenCache));
    let user: User = client.execute_json(Request::get("/users/@me")).await.unwrap();
    assert_eq!(user.username, "x");
}

#[tokio::test]
async fn test_response_headers_are_canonical() {
    let (server, client) = common::setup().await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(common::limited(4, "2.5", "abcd"))
        .mount(&server)
        .await;

    let response = client.execute(Request::get("/users/@me")).await.unwrap();

    assert!(response.headers.contains_key(headers::NORMALIZED_MARKER));
    assert!(!response.headers.contains_key(headers::RATELIMIT_RESET_AFTER));
    assert_eq!(response.headers[headers::RATELIMIT_REMAINING], "4");
    assert_eq!(response.headers[headers::RATELIMIT_BUCKET], "abcd");
    let reset_at: u64 = response.headers[headers::RATELIMIT_RESET]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(reset_at > 1_600_000_000_000, "reset should be epoch ms, got {reset_at}");
}

#[tokio::test]
async fn test_huge_timeout_does_not_break_execute() {
    let config = RestConfig {
        timeout_secs: u64::MAX,
        ..RestConfig::default()
    };
    let (server, client) = common::setup_with(config).await;

    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "1",
            "username": "x"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let user: User = client
        .execute_json(Request::get("/users/@me"))
        .await
        .expect("execute_json failed");
    assert_eq!(user.id, "1");
}

#[tokio::test]
async fn test_transport_error_leaves_bucket_untouched() {
    // Nothing listens on port 9 (discard) in the test environment.
    let client = RestClient::with_base_url(common::TOKEN, "http://127.0.0.1:9").unwrap();
    let request = Request::get("/users/@me");
    let key = request.rate_limit_key();

    let result = client.execute(request).await;

    assert!(matches!(result, Err(RestError::Transport(_))), "{result:?}");
    let bucket = client.rate_limiter().bucket(&key);
    assert_eq!(bucket.snapshot(), Default::default());
    assert!(!bucket.is_busy());
}
