//! Cluster leader election: one node becomes the authorized writer for
//! cluster-wide singletons (cron, log-aggregator flush, retention GC, cache
//! invalidation broadcaster).
//!
//! Protocol (SPEC_FULL.md §4.2): every `RENEWAL_INTERVAL` the node attempts
//! `set_nx(leader_key, node_id, TTL)`; once leader, renewal uses an atomic
//! compare-and-extend script so a stale node can never silently keep a
//! lease it no longer holds. In single-node mode (the store has no `eval`)
//! there is no contention, so the node is leader immediately and forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llmgate_store::{scripts, Store};
use llmgate_types::Result;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RENEWAL_INTERVAL: Duration = Duration::from_secs(10);
const LEASE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_LEADER_KEY: &str = "leader_key";

/// Elects and tracks this node's leadership over `store`.
pub struct LeaderElection {
    store: Arc<dyn Store>,
    node_id: String,
    leader_key: String,
    is_leader: Arc<AtomicBool>,
    elected_once: Arc<Notify>,
    cancel: CancellationToken,
}

impl LeaderElection {
    /// Starts the election loop in the background and returns a handle.
    /// Callers must hold on to the returned handle (and its `cancel` token)
    /// for the lifetime of the process; dropping it does not stop the loop.
    pub fn start(store: Arc<dyn Store>) -> Arc<Self> {
        Self::start_with_key(store, DEFAULT_LEADER_KEY)
    }

    pub fn start_with_key(store: Arc<dyn Store>, leader_key: &str) -> Arc<Self> {
        let this = Arc::new(Self {
            store,
            node_id: Uuid::new_v4().to_string(),
            leader_key: leader_key.to_string(),
            is_leader: Arc::new(AtomicBool::new(false)),
            elected_once: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        });

        let handle = this.clone();
        tokio::spawn(async move { handle.run().await });
        this
    }

    /// Blocks until the first election attempt has completed, then returns
    /// the current atomic state. Callers must re-check after any `.await`:
    /// leadership can be lost at any suspension point.
    pub async fn is_leader(&self) -> bool {
        if !self.store.supports_eval() {
            // Single-node mode: leadership is established synchronously in
            // `run`'s first iteration, which always wins immediately.
        }
        self.elected_once.notified().await;
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Non-blocking read of the current state; only meaningful after
    /// [`LeaderElection::is_leader`] has been awaited at least once.
    pub fn is_leader_now(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if self.is_leader.load(Ordering::SeqCst) && self.store.supports_eval() {
            let _ = self
                .store
                .eval(
                    scripts::COMPARE_AND_DELETE,
                    &[self.leader_key.clone()],
                    &[self.node_id.clone()],
                )
                .await;
        }
        self.is_leader.store(false, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>) {
        if !self.store.supports_eval() {
            info!(node_id = %self.node_id, "single-node mode: assuming permanent leadership");
            self.is_leader.store(true, Ordering::SeqCst);
            self.elected_once.notify_waiters();
            return;
        }

        let mut ticker = tokio::time::interval(RENEWAL_INTERVAL);
        let mut first = true;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("leader election loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    if first {
                        self.elected_once.notify_waiters();
                        first = false;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let currently_leader = self.is_leader.load(Ordering::SeqCst);
        let outcome: Result<i64> = if currently_leader {
            self.store
                .eval(
                    scripts::COMPARE_AND_EXTEND,
                    &[self.leader_key.clone()],
                    &[self.node_id.clone(), LEASE_TTL.as_secs().to_string()],
                )
                .await
        } else {
            match self
                .store
                .set_nx(&self.leader_key, &self.node_id, Some(LEASE_TTL))
                .await
            {
                Ok(true) => Ok(1),
                Ok(false) => Ok(0),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(1) => {
                if !currently_leader {
                    info!(node_id = %self.node_id, "acquired leadership");
                }
                self.is_leader.store(true, Ordering::SeqCst);
            }
            Ok(_) => {
                if currently_leader {
                    warn!(node_id = %self.node_id, "lost leadership on renewal");
                }
                self.is_leader.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "leader election tick failed");
                self.is_leader.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmgate_store::MemoryStore;

    #[tokio::test]
    async fn single_node_is_immediately_leader() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let leader = LeaderElection::start(store);
        assert!(leader.is_leader().await);
    }
}
