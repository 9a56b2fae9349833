//! Gemini adapter: the API key is folded into the URL as `?key=<key>`
//! rather than carried in a header. Grounded on
//! `riptide_intelligence::providers::google_vertex`.

use async_trait::async_trait;
use llmgate_types::{ChannelType, EffectiveConfig, Group, Result};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use crate::adapter::{
    classify_validation_status, join_upstream_url, pick_weighted_upstream, ChannelAdapter,
    ClientPair, UpstreamRequest,
};

fn with_key_query(query: Option<&str>, key_value: &str) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("key={key_value}&{q}"),
        _ => format!("key={key_value}"),
    }
}

pub struct GeminiAdapter {
    clients: ClientPair,
}

impl GeminiAdapter {
    pub fn new(config: &EffectiveConfig) -> Result<Self> {
        Ok(Self { clients: ClientPair::build(config)? })
    }
}

#[async_trait]
impl ChannelAdapter for GeminiAdapter {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Gemini
    }

    fn build_upstream_url(
        &self,
        group: &Group,
        tail_path: &str,
        query: Option<&str>,
        key_value: &str,
    ) -> Result<UpstreamRequest> {
        let upstream = pick_weighted_upstream(&group.upstreams)?;
        let url = join_upstream_url(&upstream.url, tail_path, Some(&with_key_query(query, key_value)));
        Ok(UpstreamRequest { url, extra_headers: Vec::new() })
    }

    async fn validate_key(&self, group: &Group, key_value: &str) -> Result<bool> {
        let path = group
            .validation_path
            .as_deref()
            .unwrap_or("/v1beta/models/{model}:generateContent");
        let path = path.replace("{model}", &group.test_model);
        let upstream = pick_weighted_upstream(&group.upstreams)?;
        let url = join_upstream_url(&upstream.url, &path, Some(&with_key_query(None, key_value)));
        let payload = json!({
            "contents": [{"parts": [{"text": "ping"}]}],
            "generationConfig": {"maxOutputTokens": 1},
        });

        debug!(group = %group.name, "probing gemini key");
        let response = self
            .clients
            .buffered
            .post(&url)
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
