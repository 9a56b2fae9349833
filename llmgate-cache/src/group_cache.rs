//! Typed cache syncer instance over the group-name -> `GroupRecord` map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use llmgate_types::{GroupRecord, ProxyError, Repository, Result};

use crate::settings_cache::{effective_config, SettingsCache};
use crate::syncer::{AfterLoadHook, Loader, Syncer};

pub const GROUP_CHANNEL: &str = "groups:updated";

struct GroupLoader {
    repo: Arc<dyn Repository>,
    settings: Arc<SettingsCache>,
}

#[async_trait]
impl Loader<HashMap<String, GroupRecord>> for GroupLoader {
    async fn load(&self) -> Result<HashMap<String, GroupRecord>> {
        let settings = self.settings.get();
        let groups = self.repo.list_groups().await?;
        Ok(groups
            .into_iter()
            .map(|group| {
                let effective_config = effective_config(&settings, &group);
                let name = group.name.clone();
                (name, GroupRecord { group, effective_config })
            })
            .collect())
    }
}

pub struct GroupCache {
    syncer: Arc<Syncer<HashMap<String, GroupRecord>>>,
}

impl GroupCache {
    pub async fn new(
        store: Arc<dyn llmgate_store::Store>,
        repo: Arc<dyn Repository>,
        settings: Arc<SettingsCache>,
        leader: Option<Arc<llmgate_leader::LeaderElection>>,
    ) -> Result<Self> {
        let loader = Arc::new(GroupLoader { repo, settings });
        let syncer = Syncer::new(store, GROUP_CHANNEL, loader, None, leader).await?;
        Ok(Self { syncer })
    }

    pub fn get_by_name(&self, name: &str) -> Result<GroupRecord> {
        self.syncer
            .get()
            .get(name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("group '{name}' not found")))
    }

    pub fn all(&self) -> Arc<HashMap<String, GroupRecord>> {
        self.syncer.get()
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.syncer.invalidate().await
    }
}

/// After-load hook that cascades a settings reload into a group-cache
/// invalidation, gated by leadership (only the leader broadcasts).
pub struct InvalidateGroupsOnSettingsChange {
    pub groups: Arc<GroupCache>,
}

#[async_trait]
impl AfterLoadHook<llmgate_types::SystemSettings> for InvalidateGroupsOnSettingsChange {
    async fn after_load(&self, _settings: &llmgate_types::SystemSettings) {
        if let Err(e) = self.groups.invalidate().await {
            tracing::error!(error = %e, "failed to cascade settings invalidation into group cache");
        }
    }
}
