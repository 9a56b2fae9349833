//! OpenAI-compatible adapter: `Authorization: Bearer <key>`, chat-completions
//! validation probe. Grounded on `riptide_intelligence::providers::openai`.

use async_trait::async_trait;
use llmgate_types::{ChannelType, EffectiveConfig, Group, Result};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::adapter::{
    classify_validation_status, join_upstream_url, pick_weighted_upstream, ChannelAdapter,
    ClientPair, UpstreamRequest,
};

pub struct OpenAiAdapter {
    clients: ClientPair,
}

impl OpenAiAdapter {
    pub fn new(config: &EffectiveConfig) -> Result<Self> {
        Ok(Self { clients: ClientPair::build(config)? })
    }
}

#[async_trait]
impl ChannelAdapter for OpenAiAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::OpenAi
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
            extra_headers: vec![("authorization", format!("Bearer {key_value}"))],
        })
    }

    async fn validate_key(&self, group: &Group, key_value: &str) -> Result<bool> {
        let path = group.validation_path.as_deref().unwrap_or("/chat/completions");
        let upstream = pick_weighted_upstream(&group.upstreams)?;
        let url = join_upstream_url(&upstream.url, path, None);
        let payload = json!({
            "model": group.test_model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });

        debug!(group = %group.name, "probing openai key");
        let response = self
            .clients
            .buffered
            .post(&url)
            .header("authorization", format!("Bearer {key_value}"))
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
