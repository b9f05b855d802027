//! Shared helpers for REST integration tests
//!
//! Each helper starts a wiremock server and returns a RestClient pointed at
//! it. Rate-limit responses are built with the same header set the live
//! service sends.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use cordwire_core::{
    config::RestConfig,
    ports::{CacheKey, EntityCache},
};
use cordwire_rest::RestClient;
use wiremock::{MockServer, ResponseTemplate};

pub const TOKEN: &str = "test-token";

/// Starts a mock server and a client with default settings.
pub async fn setup() -> (MockServer, RestClient) {
    setup_with(RestConfig::default()).await
}

/// Starts a mock server and a client using `config` with the base URL
/// replaced by the server's.
pub async fn setup_with(config: RestConfig) -> (MockServer, RestClient) {
    let server = MockServer::start().await;
    let config = RestConfig {
        base_url: server.uri(),
        ..config
    };
    let client = RestClient::new(TOKEN, config).expect("client should build");
    (server, client)
}

/// A 200 response carrying rate-limit headers.
pub fn limited(remaining: u32, reset_after: &str, bucket: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("X-RateLimit-Limit", "5")
        .insert_header("X-RateLimit-Remaining", remaining.to_string().as_str())
        .insert_header("X-RateLimit-Reset-After", reset_after)
        .insert_header("X-RateLimit-Bucket", bucket)
        .set_body_json(serde_json::json!({}))
}

/// Entity cache that records what it receives.
#[derive(Default)]
pub struct RecordingCache {
    pub entries: Mutex<HashMap<CacheKey, serde_json::Value>>,
    pub evicted: Mutex<Vec<CacheKey>>,
}

#[async_trait]
impl EntityCache for RecordingCache {
    async fn store(&self, key: CacheKey, entity: serde_json::Value) -> anyhow::Result<()> {
        self.entries.lock().unwrap().insert(key, entity);
        Ok(())
    }

    async fn evict(&self, key: &CacheKey) -> anyhow::Result<()> {
        self.evicted.lock().unwrap().push(key.clone());
        Ok(())
    }
}

/// Entity cache that always fails.
pub struct BrokenCache;

#[async_trait]
impl EntityCache for BrokenCache {
    async fn store(&self, _key: CacheKey, _entity: serde_json::Value) -> anyhow::Result<()> {
        anyhow::bail!("cache offline")
    }

    async fn evict(&self, _key: &CacheKey) -> anyhow::Result<()> {
        anyhow::bail!("cache offline")
    }
}
