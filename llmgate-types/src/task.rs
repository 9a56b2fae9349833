//! Single-slot, process/cluster-wide task status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BulkKeyImport,
    GroupValidation,
}

/// The single global task slot stored under `global_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_type: TaskType,
    pub group_name: String,
    pub processed: u64,
    pub total: u64,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskStatus {
    pub fn new(task_type: TaskType, group_name: impl Into<String>, total: u64) -> Self {
        Self {
            task_type,
            group_name: group_name.into(),
            processed: 0,
            total,
            running: true,
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Duration since start, or since start to end if finished.
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}
