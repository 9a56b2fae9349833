//! Typed cache syncer instance over `SystemSettings`.

use std::sync::Arc;

use async_trait::async_trait;
use llmgate_types::{EffectiveConfig, Repository, Result, SystemSettings};

use crate::syncer::{AfterLoadHook, Loader, Syncer};

struct SettingsLoader {
    repo: Arc<dyn Repository>,
}

#[async_trait]
impl Loader<SystemSettings> for SettingsLoader {
    async fn load(&self) -> Result<SystemSettings> {
        self.repo.load_settings().await
    }
}

pub const SETTINGS_CHANNEL: &str = "system_settings:updated";

pub struct SettingsCache {
    syncer: Arc<Syncer<SystemSettings>>,
}

impl SettingsCache {
    pub async fn new(
        store: Arc<dyn llmgate_store::Store>,
        repo: Arc<dyn Repository>,
        leader: Option<Arc<llmgate_leader::LeaderElection>>,
    ) -> Result<Self> {
        let loader = Arc::new(SettingsLoader { repo });
        let syncer = Syncer::new(store, SETTINGS_CHANNEL, loader, None, leader).await?;
        Ok(Self { syncer })
    }

    pub fn get(&self) -> Arc<SystemSettings> {
        self.syncer.get()
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.syncer.invalidate().await
    }

    /// Wires the leader-only cascade: once settings change, the group
    /// cache (which derives `EffectiveConfig` from them) must reload too.
    pub async fn cascade_into(&self, hook: Arc<dyn AfterLoadHook<SystemSettings>>) {
        self.syncer.set_hook(hook).await;
    }
}

/// Computes an `EffectiveConfig` from the current settings snapshot plus a
/// group's overrides, the basis for the group cache's loader.
pub fn effective_config(settings: &SystemSettings, group: &llmgate_types::Group) -> EffectiveConfig {
    EffectiveConfig::merge(settings, &group.config)
}
