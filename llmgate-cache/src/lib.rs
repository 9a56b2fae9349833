//! Cluster-coherent caches for groups and system settings.

pub mod group_cache;
pub mod settings_cache;
pub mod syncer;

pub use group_cache::{GroupCache, InvalidateGroupsOnSettingsChange, GROUP_CHANNEL};
pub use settings_cache::{effective_config, SettingsCache, SETTINGS_CHANNEL};
pub use syncer::{AfterLoadHook, Loader, Syncer};
