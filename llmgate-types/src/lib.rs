//! Domain model and error taxonomy shared by every crate in the
//! request-path and key-lifecycle engine.

pub mod error;
pub mod group;
pub mod key;
pub mod log;
pub mod repository;
pub mod settings;
pub mod task;

pub use error::{ProxyError, Result};
pub use group::{ChannelType, EffectiveConfig, Group, GroupConfigOverrides, GroupRecord, Upstream};
pub use key::{ApiKey, KeyStatus};
pub use log::{GroupHourlyStat, RequestLog};
pub use repository::{LogBatch, Repository};
pub use settings::{SettingKind, SettingMeta, SystemSettings, SETTINGS_METADATA};
pub use task::{TaskStatus, TaskType};
