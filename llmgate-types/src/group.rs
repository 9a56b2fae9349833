//! Group (tenant) data model.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::settings::SystemSettings;

/// Upstream protocol family a group's keys speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    OpenAi,
    Gemini,
    Anthropic,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAi => "openai",
            ChannelType::Gemini => "gemini",
            ChannelType::Anthropic => "anthropic",
        }
    }
}

/// One upstream base URL behind a group, with its load-balancing weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub url: String,
    pub weight: u32,
}

/// Per-field override of [`SystemSettings`]; `None` means "inherit".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfigOverrides {
    pub blacklist_threshold: Option<u32>,
    pub max_retries: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub key_validation_interval_minutes: Option<u32>,
}

/// A tenant: a named pool of keys, upstreams, and channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub channel_type: ChannelType,
    pub upstreams: Vec<Upstream>,
    pub test_model: String,
    pub validation_path: Option<String>,
    pub config: GroupConfigOverrides,
    pub param_overrides: HashMap<String, serde_json::Value>,
    /// Comma-separated shared secrets; empty means no proxy-level gate.
    pub proxy_keys: Vec<String>,
    pub last_validated_at: Option<DateTime<Utc>>,
}

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 30;

impl Group {
    /// Validates the invariants from the data model: name charset/length,
    /// at least one upstream, and every weight positive.
    pub fn validate(&self) -> Result<()> {
        if self.name.len() < NAME_MIN || self.name.len() > NAME_MAX {
            return Err(ProxyError::Validation(format!(
                "group name must be {NAME_MIN}-{NAME_MAX} characters, got {}",
                self.name.len()
            )));
        }
        if !self
            .name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(ProxyError::Validation(
                "group name must be lowercase alphanumeric/underscore/hyphen".into(),
            ));
        }
        if self.upstreams.is_empty() {
            return Err(ProxyError::Validation(
                "group must have at least one upstream".into(),
            ));
        }
        for up in &self.upstreams {
            if up.weight == 0 {
                return Err(ProxyError::Validation(format!(
                    "upstream '{}' has non-positive weight",
                    up.url
                )));
            }
            if !(up.url.starts_with("http://") || up.url.starts_with("https://")) {
                return Err(ProxyError::Validation(format!(
                    "upstream '{}' is not http(s)",
                    up.url
                )));
            }
        }
        Ok(())
    }
}

/// `SystemSettings` merged with a group's overrides: the config the proxy
/// executor and key pool manager actually use for a given request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub blacklist_threshold: u32,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub key_validation_interval_minutes: u32,
    pub response_header_timeout_secs: u64,
    pub idle_conn_timeout_secs: u64,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
}

impl EffectiveConfig {
    /// Merges `settings` with `overrides`, preferring the override where set.
    pub fn merge(settings: &SystemSettings, overrides: &GroupConfigOverrides) -> Self {
        Self {
            blacklist_threshold: overrides
                .blacklist_threshold
                .unwrap_or(settings.blacklist_threshold),
            max_retries: overrides.max_retries.unwrap_or(settings.max_retries),
            request_timeout_secs: overrides
                .request_timeout_secs
                .unwrap_or(settings.request_timeout_secs),
            connect_timeout_secs: overrides
                .connect_timeout_secs
                .unwrap_or(settings.connect_timeout_secs),
            key_validation_interval_minutes: overrides
                .key_validation_interval_minutes
                .unwrap_or(settings.key_validation_interval_minutes),
            response_header_timeout_secs: settings.response_header_timeout_secs,
            idle_conn_timeout_secs: settings.idle_conn_timeout_secs,
            max_idle_conns: settings.max_idle_conns,
            max_idle_conns_per_host: settings.max_idle_conns_per_host,
        }
    }
}

/// A [`Group`] with its precomputed [`EffectiveConfig`], as held by the
/// group cache snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group: Group,
    pub effective_config: EffectiveConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_group() -> Group {
        Group {
            id: 1,
            name: "acme_prod".into(),
            display_name: "Acme Prod".into(),
            channel_type: ChannelType::OpenAi,
            upstreams: vec![Upstream {
                url: "https://api.openai.com".into(),
                weight: 1,
            }],
            test_model: "gpt-4o-mini".into(),
            validation_path: None,
            config: GroupConfigOverrides::default(),
            param_overrides: HashMap::new(),
            proxy_keys: vec![],
            last_validated_at: None,
        }
    }

    #[test]
    fn rejects_short_name() {
        let mut g = base_group();
        g.name = "ab".into();
        assert!(g.validate().is_err());
    }

    #[test]
    fn rejects_zero_weight_upstream() {
        let mut g = base_group();
        g.upstreams[0].weight = 0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn rejects_non_http_upstream() {
        let mut g = base_group();
        g.upstreams[0].url = "ftp://example.com".into();
        assert!(g.validate().is_err());
    }

    #[test]
    fn accepts_valid_group() {
        assert!(base_group().validate().is_ok());
    }
}
