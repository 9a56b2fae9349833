//! Transactional relational store abstraction.
//!
//! The schema, migrations, and ORM are explicitly out of scope (SPEC_FULL.md
//! §1); this trait is the seam the core consumes so the rest of this crate
//! never imports a concrete database driver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::group::Group;
use crate::key::ApiKey;
use crate::log::{GroupHourlyStat, RequestLog};
use crate::settings::SystemSettings;

/// One batch of request logs plus the per-key counter deltas and hourly
/// rollups the aggregator computed for them, applied in a single
/// transaction by the implementation.
#[derive(Debug, Clone, Default)]
pub struct LogBatch {
    pub logs: Vec<RequestLog>,
    /// (key_id, request_delta, failure_delta)
    pub key_counter_deltas: Vec<(i64, u64, u64)>,
    pub hourly_upserts: Vec<GroupHourlyStat>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<Group>>;
    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>>;
    async fn upsert_group(&self, group: &Group) -> Result<()>;
    async fn delete_group(&self, id: i64) -> Result<()>;
    async fn set_group_last_validated(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    async fn list_keys_for_group(&self, group_id: i64) -> Result<Vec<ApiKey>>;
    async fn insert_keys(&self, keys: &[ApiKey]) -> Result<()>;
    async fn delete_keys(&self, group_id: i64, key_ids: &[i64]) -> Result<()>;
    async fn update_key_status(&self, key_id: i64, status_update: &ApiKey) -> Result<()>;

    async fn load_settings(&self) -> Result<SystemSettings>;
    async fn upsert_setting(&self, key: &str, raw_value: &str) -> Result<()>;

    /// Applies one flushed batch atomically: inserts logs, updates per-key
    /// counters, upserts hourly rollups.
    async fn apply_log_batch(&self, batch: &LogBatch) -> Result<()>;
    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
