//! Generic cache syncer: a loader plus an invalidation-channel subscriber,
//! publishing an atomically swappable snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use llmgate_leader::LeaderElection;
use llmgate_store::Store;
use llmgate_types::Result;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Reloads the authoritative value of type `T` from its source of truth
/// (a `Repository`, another cache, etc).
#[async_trait]
pub trait Loader<T>: Send + Sync {
    async fn load(&self) -> Result<T>;
}

/// Runs after every successful reload, gated by the caller on leadership
/// where that matters (e.g. cascading an invalidation downstream).
#[async_trait]
pub trait AfterLoadHook<T>: Send + Sync {
    async fn after_load(&self, value: &T);
}

/// Holds a single atomically-swappable snapshot of `T`, refreshed whenever
/// a message arrives on `channel`. `invalidate()` does not reload locally;
/// publishing loops back through the same subscription as every other
/// node, including this one, so there is exactly one reload code path.
pub struct Syncer<T: Send + Sync + 'static> {
    snapshot: ArcSwap<T>,
    store: Arc<dyn Store>,
    channel: String,
    loader: Arc<dyn Loader<T>>,
    hook: RwLock<Option<Arc<dyn AfterLoadHook<T>>>>,
    leader: Option<Arc<LeaderElection>>,
}

impl<T: Send + Sync + 'static> Syncer<T> {
    /// Invokes the loader once (a failure here is fatal, propagated to the
    /// caller), subscribes to `channel`, and spawns the background
    /// reload-on-message task.
    pub async fn new(
        store: Arc<dyn Store>,
        channel: impl Into<String>,
        loader: Arc<dyn Loader<T>>,
        hook: Option<Arc<dyn AfterLoadHook<T>>>,
        leader: Option<Arc<LeaderElection>>,
    ) -> Result<Arc<Self>> {
        let channel = channel.into();
        let initial = loader.load().await?;

        let this = Arc::new(Self {
            snapshot: ArcSwap::from_pointee(initial),
            store,
            channel,
            loader,
            hook: RwLock::new(hook),
            leader,
        });

        if let Some(hook) = this.hook.read().await.clone() {
            this.run_hook(hook.as_ref()).await;
        }

        let handle = this.clone();
        let mut sub = handle.store.subscribe(&handle.channel).await?;
        tokio::spawn(async move {
            while let Some(_msg) = sub.next().await {
                handle.reload().await;
            }
        });

        Ok(this)
    }

    /// Returns the current snapshot. Snapshots are immutable; callers hold
    /// the `Arc` for as long as they need a consistent view.
    pub fn get(&self) -> Arc<T> {
        self.snapshot.load_full()
    }

    /// Publishes on the invalidation channel. Every subscriber (including
    /// this node) reloads from the same authoritative loader.
    pub async fn invalidate(&self) -> Result<()> {
        self.store.publish(&self.channel, "invalidate").await?;
        Ok(())
    }

    /// Replaces the after-load hook. Used to break the bootstrap cycle
    /// between the settings cache and the group cache: the settings
    /// syncer is constructed first (without a hook), the group cache is
    /// built from its initial snapshot, and only then is the settings
    /// syncer told to cascade future reloads into the group cache.
    pub async fn set_hook(&self, hook: Arc<dyn AfterLoadHook<T>>) {
        *self.hook.write().await = Some(hook);
    }

    async fn reload(&self) {
        match self.loader.load().await {
            Ok(value) => {
                self.snapshot.store(Arc::new(value));
                info!(channel = %self.channel, "cache snapshot reloaded");
                if let Some(hook) = self.hook.read().await.clone() {
                    self.run_hook(hook.as_ref()).await;
                }
            }
            Err(e) => {
                error!(channel = %self.channel, error = %e, "cache reload failed, keeping previous snapshot");
            }
        }
    }

    async fn run_hook(&self, hook: &dyn AfterLoadHook<T>) {
        let gated = match &self.leader {
            Some(leader) => leader.is_leader().await,
            None => true,
        };
        if gated {
            let snapshot = self.get();
            hook.after_load(&snapshot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmgate_store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingLoader {
        count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Loader<u32> for CountingLoader {
        async fn load(&self) -> Result<u32> {
            Ok(self.count.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn invalidate_triggers_reload() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let count = Arc::new(AtomicU32::new(0));
        let loader = Arc::new(CountingLoader {
            count: count.clone(),
        });
        let syncer = Syncer::new(store, "test:chan", loader, None, None)
            .await
            .unwrap();
        assert_eq!(*syncer.get(), 0);
        syncer.invalidate().await.unwrap();
        // give the background subscriber task a chance to run
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*syncer.get(), 1);
    }
}
