//! Request log and rollup statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One forwarded request, as recorded by the proxy executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub group_id: i64,
    pub key_id: i64,
    /// Denormalized for fast rollup without a join.
    pub key_value: String,
    pub source_ip: String,
    pub status_code: u16,
    pub is_success: bool,
    pub path: String,
    pub duration_ms: u64,
    pub error_excerpt: Option<String>,
}

/// Hour-truncated rollup of success/failure counts for one group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupHourlyStat {
    pub hour: DateTime<Utc>,
    pub group_id: i64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl RequestLog {
    /// Truncates `timestamp` to the top of the hour, per the rollup key.
    pub fn hour_bucket(&self) -> DateTime<Utc> {
        self.timestamp
            .date_naive()
            .and_hms_opt(self.timestamp.time().hour(), 0, 0)
            .expect("valid hour")
            .and_utc()
    }
}

use chrono::Timelike;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_bucket_truncates_minutes_and_seconds() {
        let log = RequestLog {
            id: Uuid::new_v4(),
            timestamp: "2026-07-30T14:37:52Z".parse().unwrap(),
            group_id: 1,
            key_id: 1,
            key_value: "k".into(),
            source_ip: "127.0.0.1".into(),
            status_code: 200,
            is_success: true,
            path: "/v1/chat/completions".into(),
            duration_ms: 10,
            error_excerpt: None,
        };
        let bucket = log.hour_bucket();
        assert_eq!(bucket.to_rfc3339(), "2026-07-30T14:00:00+00:00");
    }
}
