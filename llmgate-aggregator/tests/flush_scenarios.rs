//! S6: 500 logs buffered with a 1-tick interval produce exactly one
//! flushed batch of 500 rows, with matching per-key and per-hour sums.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmgate_aggregator::RequestLogAggregator;
use llmgate_leader::LeaderElection;
use llmgate_store::MemoryStore;
use llmgate_types::{
    ApiKey, Group, LogBatch, Repository, RequestLog, Result, SystemSettings,
};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct CapturingRepo {
    batches: Mutex<Vec<LogBatch>>,
    applied_rows: AtomicUsize,
}

#[async_trait]
impl Repository for CapturingRepo {
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
    async fn apply_log_batch(&self, batch: &LogBatch) -> Result<()> {
        self.applied_rows.fetch_add(batch.logs.len(), Ordering::SeqCst);
        self.batches.lock().push(batch.clone());
        Ok(())
    }
    async fn delete_logs_older_than(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }
}

fn sample_log(group_id: i64, key_id: i64, is_success: bool, hour: DateTime<Utc>) -> RequestLog {
    RequestLog {
        id: Uuid::new_v4(),
        timestamp: hour,
        group_id,
        key_id,
        key_value: "k".into(),
        source_ip: "127.0.0.1".into(),
        status_code: if is_success { 200 } else { 500 },
        is_success,
        path: "/v1/chat/completions".into(),
        duration_ms: 5,
        error_excerpt: None,
    }
}

#[tokio::test(start_paused = true)]
async fn s6_buffered_logs_flush_as_one_batch_with_matching_sums() {
    let store = Arc::new(MemoryStore::default());
    let repo = Arc::new(CapturingRepo::default());
    let leader = LeaderElection::start(store.clone());
    leader.is_leader().await;

    let aggregator = RequestLogAggregator::start(
        store,
        repo.clone() as Arc<dyn Repository>,
        leader,
        1,
        30,
    );

    let hour = Utc::now();
    let mut expected_success = 0u64;
    let mut expected_failure = 0u64;
    for i in 0..500 {
        let is_success = i % 3 != 0;
        if is_success {
            expected_success += 1;
        } else {
            expected_failure += 1;
        }
        aggregator.record(sample_log(1, (i % 5) + 1, is_success, hour));
    }

    // Give the consumer task a moment to drain the channel into the store
    // before the flush ticker's first tick fires.
    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(repo.applied_rows.load(Ordering::SeqCst), 500);

    let batches = repo.batches.lock();
    assert_eq!(batches.len(), 1, "all 500 buffered logs should flush in a single batch");
    let batch = &batches[0];
    assert_eq!(batch.logs.len(), 500);

    let total_request_delta: u64 = batch.key_counter_deltas.iter().map(|(_, r, _)| r).sum();
    assert_eq!(total_request_delta, 500);
    let total_failure_delta: u64 = batch.key_counter_deltas.iter().map(|(_, _, f)| f).sum();
    assert_eq!(total_failure_delta, expected_failure);

    assert_eq!(batch.hourly_upserts.len(), 1, "every log falls in the same hour bucket");
    let stat = &batch.hourly_upserts[0];
    assert_eq!(stat.group_id, 1);
    assert_eq!(stat.success_count, expected_success);
    assert_eq!(stat.failure_count, expected_failure);

    aggregator.shutdown(Duration::from_secs(1)).await;
}
