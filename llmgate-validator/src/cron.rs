//! Leader-only periodic task that enqueues every group's keys for
//! revalidation once their configured interval has elapsed.

use std::sync::Arc;

use chrono::Utc;
use llmgate_cache::GroupCache;
use llmgate_leader::LeaderElection;
use llmgate_types::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ValidatorPool;

pub struct KeyCron {
    groups: Arc<GroupCache>,
    repo: Arc<dyn Repository>,
    validator: Arc<ValidatorPool>,
    leader: Arc<LeaderElection>,
}

impl KeyCron {
    pub fn new(
        groups: Arc<GroupCache>,
        repo: Arc<dyn Repository>,
        validator: Arc<ValidatorPool>,
        leader: Arc<LeaderElection>,
    ) -> Self {
        Self { groups, repo, validator, leader }
    }

    /// Runs until `stop` is cancelled. `tick_interval` is deliberately
    /// shorter than any group's validation interval — per-group elapsed
    /// time is checked on every tick, not assumed to equal the tick period.
    pub async fn run(self, tick_interval: std::time::Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if self.leader.is_leader_now() {
                        self.sweep().await;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();
        for record in self.groups.all().values() {
            let interval_minutes = record.effective_config.key_validation_interval_minutes as i64;
            let due = match record.group.last_validated_at {
                None => true,
                Some(last) => (now - last).num_minutes() >= interval_minutes,
            };
            if !due {
                continue;
            }

            let keys = match self.repo.list_keys_for_group(record.group.id).await {
                Ok(k) => k,
                Err(e) => {
                    warn!(group = %record.group.name, error = %e, "failed to list keys for revalidation sweep");
                    continue;
                }
            };

            let mut submitted = 0;
            for key in keys {
                match self.validator.submit(key.id, key.value.clone(), record.group.clone()) {
                    Ok(()) => submitted += 1,
                    Err(e) => {
                        debug!(group = %record.group.name, key_id = key.id, error = %e, "validator queue rejected submission");
                    }
                }
            }
            info!(group = %record.group.name, submitted, "enqueued group for key revalidation");

            if let Err(e) = self.repo.set_group_last_validated(record.group.id, now).await {
                warn!(group = %record.group.name, error = %e, "failed to persist last_validated_at");
            }
        }
    }
}
