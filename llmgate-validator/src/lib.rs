//! Bounded-queue, semaphore-gated worker pool that probes key validity
//! against each group's channel adapter and feeds the outcome back into the
//! key pool manager.
//!
//! Grounded on `riptide_workers::worker::Worker`'s `max_concurrent_jobs`
//! semaphore pattern: a fixed-size permit pool gates how many validation
//! probes run at once, independent of how many jobs are queued.

pub mod cron;

pub use cron::KeyCron;

use std::sync::Arc;

use llmgate_channels::AdapterRegistry;
use llmgate_keypool::KeyPoolManager;
use llmgate_types::{ChannelType, Group, ProxyError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One key to probe, carrying everything the worker needs without holding
/// a reference back into the group cache.
pub struct ValidationJob {
    pub key_id: i64,
    pub key_value: String,
    pub group: Group,
}

struct PoolHandles {
    dispatcher: tokio::task::JoinHandle<()>,
}

pub struct ValidatorPool {
    sender: mpsc::Sender<ValidationJob>,
    stop: CancellationToken,
    handles: Mutex<Option<PoolHandles>>,
}

impl ValidatorPool {
    /// Spawns the dispatcher task and returns a handle to submit jobs.
    /// `concurrency` is `settings.key_validation_concurrency`; the queue
    /// bound is `concurrency * 4`.
    pub fn start(
        concurrency: usize,
        key_pool: Arc<KeyPoolManager>,
        adapters: Arc<AdapterRegistry>,
    ) -> Arc<Self> {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::channel(concurrency * 4);
        let stop = CancellationToken::new();

        let dispatcher = tokio::spawn(run_dispatcher(
            receiver,
            Arc::new(Semaphore::new(concurrency)),
            key_pool,
            adapters,
            stop.clone(),
        ));

        Arc::new(Self { sender, stop, handles: Mutex::new(Some(PoolHandles { dispatcher })) })
    }

    /// Non-blocking submission; fails fast when the queue is full rather
    /// than back-pressuring the caller (the key cron and manual
    /// revalidation requests both call this from contexts that must not
    /// block).
    pub fn submit(&self, key_id: i64, key_value: String, group: Group) -> Result<()> {
        self.sender
            .try_send(ValidationJob { key_id, key_value, group })
            .map_err(|_| ProxyError::Validation("validator queue full".into()))
    }

    /// Cancels the dispatcher and waits up to `shutdown_deadline` for
    /// in-flight probes to finish; anything still running past the
    /// deadline, and every job still queued, is dropped.
    pub async fn shutdown(&self, shutdown_deadline: std::time::Duration) {
        self.stop.cancel();
        let handle = self.handles.lock().take();
        if let Some(handles) = handle {
            if tokio::time::timeout(shutdown_deadline, handles.dispatcher).await.is_err() {
                warn!("validator pool did not drain within the shutdown deadline, abandoning in-flight probes");
            }
        }
    }
}

async fn run_dispatcher(
    mut receiver: mpsc::Receiver<ValidationJob>,
    semaphore: Arc<Semaphore>,
    key_pool: Arc<KeyPoolManager>,
    adapters: Arc<AdapterRegistry>,
    stop: CancellationToken,
) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("validator pool dispatcher stopping, draining in-flight probes");
                break;
            }
            job = receiver.recv() => {
                let Some(job) = job else { break };
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let key_pool = key_pool.clone();
                let adapters = adapters.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    run_one_probe(job, key_pool, adapters).await;
                });
            }
        }
    }
    while in_flight.join_next().await.is_some() {}
}

async fn run_one_probe(job: ValidationJob, key_pool: Arc<KeyPoolManager>, adapters: Arc<AdapterRegistry>) {
    let channel_type: ChannelType = job.group.channel_type;
    let Some(adapter) = adapters.get(channel_type) else {
        warn!(key_id = job.key_id, "no adapter registered for group's channel type");
        return;
    };

    match adapter.validate_key(&job.group, &job.key_value).await {
        Ok(true) => {
            if let Err(e) = key_pool.restore_key(job.key_id, job.group.id).await {
                warn!(key_id = job.key_id, error = %e, "failed to restore validated key");
            }
        }
        Ok(false) => {
            let _ = key_pool
                .record_failure(job.key_id, job.group.id, 1, "validation probe rejected key")
                .await;
            info!(key_id = job.key_id, "key failed validation probe, marked invalid");
        }
        Err(e) => {
            debug!(key_id = job.key_id, error = %e, "validation probe was transient, leaving key state unchanged");
        }
    }
}
