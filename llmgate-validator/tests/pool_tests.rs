use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmgate_channels::AdapterRegistry;
use llmgate_keypool::KeyPoolManager;
use llmgate_store::MemoryStore;
use llmgate_types::{
    ApiKey, ChannelType, Group, GroupConfigOverrides, KeyStatus, LogBatch, Repository, Result,
    SystemSettings, Upstream,
};
use llmgate_validator::ValidatorPool;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

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

fn test_group(upstream: &str) -> Group {
    Group {
        id: 1,
        name: "acme".into(),
        display_name: "Acme".into(),
        channel_type: ChannelType::OpenAi,
        upstreams: vec![Upstream { url: upstream.to_string(), weight: 1 }],
        test_model: "gpt-4o-mini".into(),
        validation_path: None,
        config: GroupConfigOverrides::default(),
        param_overrides: Default::default(),
        proxy_keys: Vec::new(),
        last_validated_at: None,
    }
}

async fn seed_key(pool: &KeyPoolManager, group_id: i64, value: &str, id: i64) {
    pool.add_keys(group_id, value, move || id).await.unwrap();
}

#[tokio::test]
async fn successful_probe_restores_key_to_active() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo: Arc<dyn Repository> = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    seed_key(&pool, 1, "good-key", 1).await;

    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());
    let validator = ValidatorPool::start(2, pool.clone(), adapters);

    validator.submit(1, "good-key".into(), test_group(&server.uri())).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let key = pool.get_key(1).await.unwrap();
    assert_eq!(key.status, KeyStatus::Active);
    assert_eq!(key.consecutive_failures, 0);

    validator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn rejected_probe_blacklists_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo: Arc<dyn Repository> = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    seed_key(&pool, 1, "bad-key", 1).await;

    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());
    let validator = ValidatorPool::start(2, pool.clone(), adapters);

    validator.submit(1, "bad-key".into(), test_group(&server.uri())).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let key = pool.get_key(1).await.unwrap();
    assert_eq!(key.status, KeyStatus::Invalid);

    validator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn submission_fails_fast_once_queue_is_full() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let repo: Arc<dyn Repository> = Arc::new(NullRepo);
    let pool = Arc::new(KeyPoolManager::new(store, repo));
    let adapters = Arc::new(AdapterRegistry::new(&SystemSettings::default()).unwrap());

    // concurrency=1 -> queue bound is 4; the one in-flight probe hangs for
    // 5s, so 4 queued jobs plus the in-flight one should exhaust capacity
    // well within this test's lifetime.
    let validator = ValidatorPool::start(1, pool, adapters);
    let group = test_group(&server.uri());

    let mut last_result = Ok(());
    for i in 0..20 {
        last_result = validator.submit(i, "some-key".into(), group.clone());
        if last_result.is_err() {
            break;
        }
    }
    assert!(last_result.is_err(), "queue should eventually reject once full");

    validator.shutdown(Duration::from_millis(50)).await;
}
