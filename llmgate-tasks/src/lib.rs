//! The single global task slot (SPEC_FULL.md §4.12): bulk key import and
//! manual group validation both run as one cluster-wide task at a time,
//! tracked under the `global_task` store key.
//!
//! Unlike `llmgate-keypool::record_failure`, starting a task is not a hot
//! path and does not need `Store::eval`-grade cross-node atomicity: a local
//! mutex serializing the check-then-write against the store is enough to
//! keep a single node from racing itself, and two operators starting a
//! bulk import on two different nodes within the same instant is an
//! acceptable, rare edge case rather than one worth a Lua script for.

use std::time::Duration;

use chrono::Utc;
use llmgate_store::Store;
use llmgate_types::{ProxyError, Result, TaskStatus, TaskType};
use tokio::sync::Mutex;
use tracing::info;

const GLOBAL_TASK_KEY: &str = "global_task";
const RESULT_RETENTION: Duration = Duration::from_secs(60 * 60);

pub struct TaskRegistry {
    store: std::sync::Arc<dyn Store>,
    lock: Mutex<()>,
}

impl TaskRegistry {
    pub fn new(store: std::sync::Arc<dyn Store>) -> Self {
        Self { store, lock: Mutex::new(()) }
    }

    /// Starts a new task, failing with [`ProxyError::TaskBusy`] if a task is
    /// already `running` and hasn't exceeded `timeout` since it started
    /// (a crashed worker that never called `end_task` must not wedge the
    /// slot forever).
    pub async fn start_task(
        &self,
        task_type: TaskType,
        group_name: &str,
        total: u64,
        timeout: Duration,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.read().await? {
            let elapsed = Utc::now() - existing.started_at;
            let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
            if existing.running && elapsed < timeout {
                return Err(ProxyError::TaskBusy);
            }
        }
        let status = TaskStatus::new(task_type, group_name, total);
        info!(group = group_name, total, "started task");
        self.write(&status, None).await
    }

    /// Overwrites the processed count on the running task.
    pub async fn update_progress(&self, processed: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut status = self
            .read()
            .await?
            .ok_or_else(|| ProxyError::NotFound("no task running".into()))?;
        status.processed = processed;
        self.write(&status, None).await
    }

    /// Marks the running task finished, stores its result or error, and
    /// retains the record for [`RESULT_RETENTION`] so a client polling
    /// after completion still sees the outcome.
    pub async fn end_task(&self, result: Option<serde_json::Value>, error: Option<String>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut status = self
            .read()
            .await?
            .ok_or_else(|| ProxyError::NotFound("no task running".into()))?;
        status.running = false;
        status.ended_at = Some(Utc::now());
        status.result = result;
        status.error = error;
        info!(group = %status.group_name, "task finished");
        self.write(&status, Some(RESULT_RETENTION)).await
    }

    pub async fn get_task_status(&self) -> Result<Option<TaskStatus>> {
        self.read().await
    }

    async fn read(&self) -> Result<Option<TaskStatus>> {
        match self.store.get(GLOBAL_TASK_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, status: &TaskStatus, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_string(status)?;
        self.store.set(GLOBAL_TASK_KEY, &raw, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmgate_store::MemoryStore;
    use std::sync::Arc;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(MemoryStore::default()))
    }

    #[tokio::test]
    async fn start_task_succeeds_when_slot_is_empty() {
        let reg = registry();
        reg.start_task(TaskType::BulkKeyImport, "acme", 100, Duration::from_secs(600))
            .await
            .unwrap();
        let status = reg.get_task_status().await.unwrap().unwrap();
        assert_eq!(status.group_name, "acme");
        assert_eq!(status.total, 100);
        assert!(status.running);
    }

    #[tokio::test]
    async fn start_task_fails_busy_while_another_task_is_running() {
        let reg = registry();
        reg.start_task(TaskType::BulkKeyImport, "acme", 100, Duration::from_secs(600))
            .await
            .unwrap();
        let err = reg
            .start_task(TaskType::GroupValidation, "other", 10, Duration::from_secs(600))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::TaskBusy));
    }

    #[tokio::test]
    async fn start_task_allowed_once_prior_task_finished() {
        let reg = registry();
        reg.start_task(TaskType::BulkKeyImport, "acme", 100, Duration::from_secs(600))
            .await
            .unwrap();
        reg.end_task(Some(serde_json::json!({"added": 100})), None).await.unwrap();

        reg.start_task(TaskType::GroupValidation, "other", 10, Duration::from_secs(600))
            .await
            .unwrap();
        let status = reg.get_task_status().await.unwrap().unwrap();
        assert_eq!(status.group_name, "other");
        assert!(status.running);
    }

    #[tokio::test]
    async fn update_progress_overwrites_processed_count() {
        let reg = registry();
        reg.start_task(TaskType::BulkKeyImport, "acme", 100, Duration::from_secs(600))
            .await
            .unwrap();
        reg.update_progress(42).await.unwrap();
        let status = reg.get_task_status().await.unwrap().unwrap();
        assert_eq!(status.processed, 42);
    }

    #[tokio::test]
    async fn end_task_marks_finished_and_records_result() {
        let reg = registry();
        reg.start_task(TaskType::GroupValidation, "acme", 5, Duration::from_secs(600))
            .await
            .unwrap();
        reg.end_task(Some(serde_json::json!({"validated": 5})), None).await.unwrap();

        let status = reg.get_task_status().await.unwrap().unwrap();
        assert!(!status.running);
        assert!(status.ended_at.is_some());
        assert_eq!(status.result, Some(serde_json::json!({"validated": 5})));
        assert!(status.duration() >= chrono::Duration::zero());
    }

    #[tokio::test]
    async fn update_progress_without_a_running_task_is_not_found() {
        let reg = registry();
        let err = reg.update_progress(1).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
