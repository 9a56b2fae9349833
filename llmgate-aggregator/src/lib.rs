//! Buffered, batched write-through of request logs and their rollup
//! statistics, plus the leader-only retention GC that reaps old rows.
//!
//! Grounded on the teacher's outbox pattern
//! (`riptide_persistence::adapters::outbox_publisher`): accept writes on a
//! channel, buffer them durably (there: Postgres outbox rows; here: the
//! store's TTL-backed keys), and let a leader-only background task flush
//! them in batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use llmgate_leader::LeaderElection;
use llmgate_store::Store;
use llmgate_types::{GroupHourlyStat, LogBatch, Repository, RequestLog};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PENDING_LOG_KEYS: &str = "pending_log_keys";
const FLUSH_BATCH_SIZE: usize = 200;
const RETENTION_GC_INTERVAL: Duration = Duration::from_secs(2 * 3600);

fn request_log_key(id: uuid::Uuid) -> String {
    format!("request_log:{id}")
}

struct Handles {
    consumer: JoinHandle<()>,
    flusher: Option<JoinHandle<()>>,
    gc: JoinHandle<()>,
}

/// Intake for `RequestLog` entries. Never blocks the request path: a full
/// channel drops the entry and logs a warning rather than applying
/// back-pressure to the proxy executor.
pub struct RequestLogAggregator {
    sender: mpsc::Sender<RequestLog>,
    stop: CancellationToken,
    handles: Mutex<Option<Handles>>,
}

impl RequestLogAggregator {
    /// Spawns the consumer, the leader-only flush ticker (skipped entirely
    /// when `write_interval_minutes == 0`, since every log is then written
    /// synchronously as it arrives), and the leader-only retention GC.
    pub fn start(
        store: Arc<dyn Store>,
        repo: Arc<dyn Repository>,
        leader: Arc<LeaderElection>,
        write_interval_minutes: u32,
        retention_days: u32,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(4096);
        let stop = CancellationToken::new();

        let consumer = tokio::spawn(run_consumer(
            receiver,
            store.clone(),
            repo.clone(),
            write_interval_minutes,
            stop.clone(),
        ));

        let flusher = (write_interval_minutes > 0).then(|| {
            tokio::spawn(run_flush_ticker(
                store,
                repo.clone(),
                leader.clone(),
                write_interval_minutes,
                stop.clone(),
            ))
        });

        let gc = tokio::spawn(run_retention_gc(repo, leader, retention_days, stop.clone()));

        Arc::new(Self { sender, stop, handles: Mutex::new(Some(Handles { consumer, flusher, gc })) })
    }

    /// Non-blocking submission from the proxy executor's hot path.
    pub fn record(&self, log: RequestLog) {
        if self.sender.try_send(log).is_err() {
            warn!("request log channel full, dropping log entry");
        }
    }

    /// A cloneable handle to the intake channel, for wiring directly into
    /// `ProxyExecutor::new`'s `log_tx` parameter.
    pub fn sender(&self) -> mpsc::Sender<RequestLog> {
        self.sender.clone()
    }

    pub async fn shutdown(&self, shutdown_deadline: Duration) {
        self.stop.cancel();
        let handles = self.handles.lock().take();
        if let Some(handles) = handles {
            let _ = tokio::time::timeout(shutdown_deadline, handles.consumer).await;
            if let Some(flusher) = handles.flusher {
                let _ = tokio::time::timeout(shutdown_deadline, flusher).await;
            }
            let _ = tokio::time::timeout(shutdown_deadline, handles.gc).await;
        }
    }
}

async fn run_consumer(
    mut receiver: mpsc::Receiver<RequestLog>,
    store: Arc<dyn Store>,
    repo: Arc<dyn Repository>,
    write_interval_minutes: u32,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            log = receiver.recv() => {
                let Some(log) = log else { break };
                if write_interval_minutes == 0 {
                    write_log_sync(&log, &repo).await;
                } else {
                    buffer_log(&log, &store, write_interval_minutes).await;
                }
            }
        }
    }
}

fn single_entry_batch(log: &RequestLog) -> LogBatch {
    let failure_delta = u64::from(!log.is_success);
    LogBatch {
        logs: vec![log.clone()],
        key_counter_deltas: vec![(log.key_id, 1, failure_delta)],
        hourly_upserts: vec![GroupHourlyStat {
            hour: log.hour_bucket(),
            group_id: log.group_id,
            success_count: u64::from(log.is_success),
            failure_count: failure_delta,
        }],
    }
}

async fn write_log_sync(log: &RequestLog, repo: &Arc<dyn Repository>) {
    if let Err(e) = repo.apply_log_batch(&single_entry_batch(log)).await {
        warn!(id = %log.id, error = %e, "failed to write request log synchronously");
    }
}

async fn buffer_log(log: &RequestLog, store: &Arc<dyn Store>, write_interval_minutes: u32) {
    let payload = match serde_json::to_string(log) {
        Ok(p) => p,
        Err(e) => {
            warn!(id = %log.id, error = %e, "failed to serialize request log, dropping");
            return;
        }
    };
    let ttl = Duration::from_secs(u64::from(write_interval_minutes) * 5 * 60);
    if let Err(e) = store.set(&request_log_key(log.id), &payload, Some(ttl)).await {
        warn!(id = %log.id, error = %e, "failed to buffer request log in store");
        return;
    }
    if let Err(e) = store.sadd(PENDING_LOG_KEYS, &[log.id.to_string()]).await {
        warn!(id = %log.id, error = %e, "failed to track buffered request log id");
    }
}

async fn run_flush_ticker(
    store: Arc<dyn Store>,
    repo: Arc<dyn Repository>,
    leader: Arc<LeaderElection>,
    write_interval_minutes: u32,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(write_interval_minutes) * 60));
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if leader.is_leader_now() {
                    flush_once(&store, &repo).await;
                }
            }
        }
    }
}

async fn flush_once(store: &Arc<dyn Store>, repo: &Arc<dyn Repository>) {
    let ids = match store.spop_n(PENDING_LOG_KEYS, FLUSH_BATCH_SIZE).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "failed to pop pending request log ids");
            return;
        }
    };
    if ids.is_empty() {
        return;
    }

    let mut logs = Vec::with_capacity(ids.len());
    for id in &ids {
        match store.get(&format!("request_log:{id}")).await {
            Ok(Some(payload)) => match serde_json::from_str::<RequestLog>(&payload) {
                Ok(log) => logs.push(log),
                Err(e) => warn!(id, error = %e, "dropping unparseable buffered request log"),
            },
            Ok(None) => debug!(id, "buffered request log expired before flush"),
            Err(e) => warn!(id, error = %e, "failed to read buffered request log"),
        }
    }

    if logs.is_empty() {
        return;
    }

    let batch = build_batch(&logs);
    let batch_size = logs.len();
    match repo.apply_log_batch(&batch).await {
        Ok(()) => {
            for id in &ids {
                let _ = store.del(&format!("request_log:{id}")).await;
            }
            info!(batch_size, "flushed buffered request logs");
        }
        Err(e) => {
            warn!(error = %e, batch_size, "failed to apply request log batch, re-queuing");
            if let Err(e) = store.sadd(PENDING_LOG_KEYS, &ids).await {
                warn!(error = %e, "failed to re-queue request log ids after a failed flush");
            }
        }
    }
}

fn build_batch(logs: &[RequestLog]) -> LogBatch {
    use std::collections::HashMap;

    let mut key_deltas: HashMap<i64, (u64, u64)> = HashMap::new();
    let mut hourly: HashMap<(chrono::DateTime<Utc>, i64), (u64, u64)> = HashMap::new();

    for log in logs {
        let entry = key_deltas.entry(log.key_id).or_insert((0, 0));
        entry.0 += 1;
        if !log.is_success {
            entry.1 += 1;
        }

        let bucket = hourly.entry((log.hour_bucket(), log.group_id)).or_insert((0, 0));
        if log.is_success {
            bucket.0 += 1;
        } else {
            bucket.1 += 1;
        }
    }

    LogBatch {
        logs: logs.to_vec(),
        key_counter_deltas: key_deltas.into_iter().map(|(k, (r, f))| (k, r, f)).collect(),
        hourly_upserts: hourly
            .into_iter()
            .map(|((hour, group_id), (success_count, failure_count))| GroupHourlyStat {
                hour,
                group_id,
                success_count,
                failure_count,
            })
            .collect(),
    }
}

async fn run_retention_gc(
    repo: Arc<dyn Repository>,
    leader: Arc<LeaderElection>,
    retention_days: u32,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RETENTION_GC_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if leader.is_leader_now() {
                    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    match repo.delete_logs_older_than(cutoff).await {
                        Ok(deleted) => info!(deleted, "ran request log retention GC"),
                        Err(e) => warn!(error = %e, "request log retention GC failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn sample_log(group_id: i64, key_id: i64, is_success: bool) -> RequestLog {
        RequestLog {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            group_id,
            key_id,
            key_value: "k".into(),
            source_ip: "127.0.0.1".into(),
            status_code: if is_success { 200 } else { 500 },
            is_success,
            path: "/v1/chat/completions".into(),
            duration_ms: 12,
            error_excerpt: None,
        }
    }

    #[test]
    fn single_entry_batch_has_one_log_and_matching_deltas() {
        let log = sample_log(1, 7, false);
        let batch = single_entry_batch(&log);
        assert_eq!(batch.logs.len(), 1);
        assert_eq!(batch.key_counter_deltas, vec![(7, 1, 1)]);
        assert_eq!(batch.hourly_upserts[0].failure_count, 1);
        assert_eq!(batch.hourly_upserts[0].success_count, 0);
    }

    #[test]
    fn build_batch_aggregates_per_key_and_per_hour() {
        let mut a = sample_log(1, 1, true);
        let mut b = sample_log(1, 1, false);
        let mut c = sample_log(1, 2, true);
        let hour = Utc::now();
        a.timestamp = hour;
        b.timestamp = hour;
        c.timestamp = hour + ChronoDuration::minutes(10);

        let batch = build_batch(&[a, b, c]);
        assert_eq!(batch.logs.len(), 3);

        let key_one = batch.key_counter_deltas.iter().find(|(k, _, _)| *k == 1).unwrap();
        assert_eq!(*key_one, (1, 2, 1));
        let key_two = batch.key_counter_deltas.iter().find(|(k, _, _)| *k == 2).unwrap();
        assert_eq!(*key_two, (2, 1, 0));

        assert_eq!(batch.hourly_upserts.len(), 1, "both logs fall in the same hour bucket");
        let stat = &batch.hourly_upserts[0];
        assert_eq!(stat.success_count, 1);
        assert_eq!(stat.failure_count, 1);
    }

    #[test]
    fn request_log_key_formats_with_id() {
        let id = Uuid::nil();
        assert_eq!(request_log_key(id), format!("request_log:{id}"));
    }
}
