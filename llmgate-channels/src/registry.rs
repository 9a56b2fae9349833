//! Indexes one `ChannelAdapter` per `ChannelType`, rebuilt whenever the
//! system settings the client pools were built from go stale. Grounded on
//! `riptide_intelligence::registry::LlmRegistry`'s name-keyed provider map.

use std::sync::Arc;

use llmgate_types::{ChannelType, EffectiveConfig, GroupConfigOverrides, Result, SystemSettings};
use parking_lot::RwLock;
use tracing::info;

use crate::adapter::ChannelAdapter;
use crate::anthropic::AnthropicAdapter;
use crate::gemini::GeminiAdapter;
use crate::openai::OpenAiAdapter;

/// The registry builds its adapters from the system-wide defaults, not a
/// particular group's overrides: a `ChannelType` maps to exactly one HTTP
/// client pair, shared across every group of that type. A group's own
/// timeout overrides still govern its `EffectiveConfig` for retry/backoff
/// decisions in the proxy executor; only the underlying connection pool is
/// shared per protocol.
pub struct AdapterRegistry {
    adapters: RwLock<Vec<(ChannelType, Arc<dyn ChannelAdapter>)>>,
}

impl AdapterRegistry {
    pub fn new(settings: &SystemSettings) -> Result<Self> {
        let config = EffectiveConfig::merge(settings, &GroupConfigOverrides::default());
        let adapters = Self::build_all(&config)?;
        Ok(Self { adapters: RwLock::new(adapters) })
    }

    fn build_all(config: &EffectiveConfig) -> Result<Vec<(ChannelType, Arc<dyn ChannelAdapter>)>> {
        Ok(vec![
            (ChannelType::OpenAi, Arc::new(OpenAiAdapter::new(config)?) as Arc<dyn ChannelAdapter>),
            (ChannelType::Gemini, Arc::new(GeminiAdapter::new(config)?) as Arc<dyn ChannelAdapter>),
            (ChannelType::Anthropic, Arc::new(AnthropicAdapter::new(config)?) as Arc<dyn ChannelAdapter>),
        ])
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters
            .read()
            .iter()
            .find(|(ct, _)| *ct == channel_type)
            .map(|(_, adapter)| adapter.clone())
    }

    /// Rebuilds any adapter whose client pair was built from a now-stale
    /// config. Called from the group cache's settings-change cascade.
    pub fn refresh(&self, settings: &SystemSettings) -> Result<()> {
        let config = EffectiveConfig::merge(settings, &GroupConfigOverrides::default());
        let stale = self
            .adapters
            .read()
            .iter()
            .any(|(_, adapter)| adapter.is_config_stale(&config));
        if !stale {
            return Ok(());
        }
        info!("rebuilding channel adapter client pools after settings change");
        let rebuilt = Self::build_all(&config)?;
        *self.adapters.write() = rebuilt;
        Ok(())
    }
}
