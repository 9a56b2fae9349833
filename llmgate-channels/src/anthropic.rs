//! Anthropic adapter: `x-api-key` header plus the `anthropic-version` header
//! every Messages API call requires. Grounded on
//! `riptide_intelligence::providers::anthropic`.

use async_trait::async_trait;
use llmgate_types::{ChannelType, EffectiveConfig, Group, Result};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::adapter::{
    classify_validation_status, join_upstream_url, pick_weighted_upstream, ChannelAdapter,
    ClientPair, UpstreamRequest,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    clients: ClientPair,
}

impl AnthropicAdapter {
    pub fn new(config: &EffectiveConfig) -> Result<Self> {
        Ok(Self { clients: ClientPair::build(config)? })
    }
}

#[async_trait]
impl ChannelAdapter for AnthropicAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn build_upstream_url(
        &self,
        group: &Group,
        tail_path: &str,
        query: Option<&str>,
        key_value: &str,
    ) -> Result<UpstreamRequest> {
        let upstream = pick_weighted_upstream(&group.upstreams)?;
        let url = join_upstream_url(&upstream.url, tail_path, query);
        Ok(UpstreamRequest {
            url,
            extra_headers: vec![
                ("x-api-key", key_value.to_string()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
        })
    }

    async fn validate_key(&self, group: &Group, key_value: &str) -> Result<bool> {
        let path = group.validation_path.as_deref().unwrap_or("/v1/messages");
        let upstream = pick_weighted_upstream(&group.upstreams)?;
        let url = join_upstream_url(&upstream.url, path, None);
        let payload = json!({
            "model": group.test_model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });

        debug!(group = %group.name, "probing anthropic key");
        let response = self
            .clients
            .buffered
            .post(&url)
            .header("x-api-key", key_value)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| llmgate_types::ProxyError::UpstreamTransient(e.to_string()))?;

        classify_validation_status(response.status())
    }

    fn http_client(&self) -> &Client {
        &self.clients.buffered
    }

    fn streaming_client(&self) -> &Client {
        &self.clients.streaming
    }

    fn is_config_stale(&self, config: &EffectiveConfig) -> bool {
        self.clients.is_stale(config)
    }
}
