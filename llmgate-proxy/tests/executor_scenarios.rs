//! End-to-end fixtures for the retry/key-rotation/streaming behavior of
//! `ProxyExecutor`, run against a real HTTP server (`wiremock`) rather than
//! a hand-rolled transport fake, so the header and status handling is
//! exercised exactly as it would be against a live upstream.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use llmgate_channels::AdapterRegistry;
use llmgate_keypool::KeyPoolManager;
use llmgate_proxy::{ProxyContext, ProxyExecutor, ResponseBody};
use llmgate_store::MemoryStore;
use llmgate_types::{
    ApiKey, ChannelType, Group, GroupConfigOverrides, GroupRecord, KeyStatus, LogBatch,
    Repository, Result, SystemSettings, Upstream,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A `Repository` whose only job is to accept the write-through calls the
/// key pool manager makes; nothing here is read back by these tests, which
/// instead inspect state through `KeyPoolManager::get_key`.
struct NullRepo;

#[async_trait]
impl Repository for NullRepo {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(Vec::new())
    }
    async fn get_group_by_name(&self, _name: &str) -> Result<Option<Group>> {
        Ok(None)
    }
    async fn upsert_group(&self, _group: &Group) -> Result<()> {
        Ok(())
    }
    async fn delete_group(&self, _id: i64) -> Result<()> {
        Ok(())
    }
    async fn set_group_last_validated(&self, _id: i64, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
    async fn list_keys_for_group(&self, _group_id: i64) -> Result<Vec<ApiKey>> {
        Ok(Vec::new())
    }
    async fn insert_keys(&self, _keys: &[ApiKey]) -> Result<()> {
        Ok(())
    }
    async fn delete_keys(&self, _group_id: i64, _key_ids: &[i64]) -> Result<()> {
        Ok(())
    }
    async fn update_key_status(&self, _key_id: i64, _status_update: &ApiKey) -> Result<()> {
        Ok(())
    }
    async fn load_settings(&self) -> Result<SystemSettings> {
        Ok(SystemSettings::default())
    }
    async fn upsert_setting(&self, _key: &str, _raw_value: &str) -> Result<()> {
        Ok(())
    }
    async fn apply_log_batch(&self, _batch: &LogBatch) -> Result<()> {
        Ok(())
    }
    async fn delete_logs_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

fn group_record(upstream_base: &str, blacklist_threshold: u32, max_retries: u32) -> GroupRecord {
    let settings = SystemSettings::default();
    let overrides = GroupConfigOverrides {
        blacklist_threshold: Some(blacklist_threshold),
        max_retries: Some(max_retries),
        ..Default::default()
    };
    let group = Group {
        id: 1,
        name: "acme".into(),
        display_name: "Acme".into(),
        channel_type: ChannelType::OpenAi,
        upstreams: vec![Upstream { url: upstream_base.to_string(), weight: 1 }],
        test_model: "gpt-4o-mini".into(),
        validation_path: None,
        config: overrides.clone(),
        param_overrides: Default::default(),
        proxy_keys: Vec::new(),
        last_validated_at: None,
    };
    let effective_config = llmgate_types::EffectiveConfig::merge(&settings, &overrides);
    GroupRecord { group, effective_config }
}

async fn seed_keys(pool: &KeyPoolManager, group_id: i64, values: &[&str]) {
    let counter = AtomicI64::new(0);
    let text = values.join(",");
    pool.add_keys(group_id, &text, || counter.fetch_add(1, Ordering::SeqCst) + 1)
        .await
        .expect("seeding keys should succeed");
}

fn test_ctx() -> ProxyContext {
    ProxyContext {
        request_id: None,
        source_ip: "127.0.0.1".into(),
        cancellation: CancellationToken::new(),
    }
}

/// S1: three keys, all upstream calls return 500. Every key is tried once,
/// in rotation order, the final response echoes the last upstream status,
/// and none of the keys are blacklisted (500 is not a credential failure).
#[tokio::test]
async fn s1_retry_exhaustion_tries_every_key_and_forwards_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream overloaded"))
        .expect(3)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    seed_keys(&pool, 1, &["key-one", "key-two", "key-three"]).await;

    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());
    let executor = ProxyExecutor::new(pool.clone(), adapters, None);

    let group = group_record(&server.uri(), 2, 2);
    let response = executor
        .execute("POST", "/v1/chat/completions", None, &[], Bytes::from_static(b"{}"), &group, &test_ctx())
        .await;

    assert_eq!(response.status, 500);
    let ResponseBody::Buffered(body) = response.body else { panic!("expected buffered body") };
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let attempts = parsed["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 3);

    for key_id in 1..=3 {
        let key = pool.get_key(key_id).await.unwrap();
        assert_eq!(key.failure_count, 1);
        assert_eq!(key.status, KeyStatus::Active, "threshold is 2, one failure must not blacklist");
    }
}

/// S2: threshold=1. The first key gets a 401 (credential failure), is
/// blacklisted immediately, and the executor retries onto the second key,
/// which succeeds.
#[tokio::test]
async fn s2_credential_failure_blacklists_and_retries_onto_next_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer key-one"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer key-two"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    seed_keys(&pool, 1, &["key-one", "key-two"]).await;

    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());
    let executor = ProxyExecutor::new(pool.clone(), adapters, None);

    let group = group_record(&server.uri(), 1, 2);
    let response = executor
        .execute("POST", "/v1/chat/completions", None, &[], Bytes::from_static(b"{}"), &group, &test_ctx())
        .await;

    assert_eq!(response.status, 200);

    let key_one = pool.get_key(1).await.unwrap();
    assert_eq!(key_one.status, KeyStatus::Invalid);

    let key_two = pool.get_key(2).await.unwrap();
    assert_eq!(key_two.status, KeyStatus::Active);
    assert_eq!(key_two.request_count, 1);
}

/// S3 (streaming, relaxed): the executor forwards a streamed upstream body
/// chunk-for-chunk and records a success on normal EOF.
#[tokio::test]
async fn s3_stream_forwards_all_chunks_and_records_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: one\n\ndata: two\n\ndata: three\n\n".to_string(), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    seed_keys(&pool, 1, &["key-one"]).await;

    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());
    let executor = ProxyExecutor::new(pool.clone(), adapters, None);

    let group = group_record(&server.uri(), 3, 2);
    let body = Bytes::from_static(br#"{"stream":true}"#);
    let response = executor
        .execute("POST", "/v1/chat/completions", None, &[("accept".into(), "text/event-stream".into())], body, &group, &test_ctx())
        .await;

    assert_eq!(response.status, 200);
    let ResponseBody::Streaming(mut stream) = response.body else { panic!("expected a streaming body") };
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    let text = String::from_utf8(collected).unwrap();
    assert_eq!(text, "data: one\n\ndata: two\n\ndata: three\n\n");

    let key = pool.get_key(1).await.unwrap();
    assert_eq!(key.request_count, 1);
    assert_eq!(key.consecutive_failures, 0);
}
