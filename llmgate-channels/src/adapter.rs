//! The `ChannelAdapter` trait every upstream protocol implements, plus the
//! shared helpers (weighted upstream selection, stream-request sniffing,
//! client pair construction) that every variant builds on.
//!
//! Grounded on `riptide_intelligence::provider::LlmProvider` (the async
//! trait shape, `name()`/`health_check()` split) and
//! `riptide_intelligence::providers::base::HttpClientBuilder` (the
//! timeout-parameterized client builder).

use std::time::Duration;

use async_trait::async_trait;
use llmgate_types::{EffectiveConfig, Group, ProxyError, Result, Upstream};
use rand::Rng;
use reqwest::Client;

/// Headers that must never be forwarded between proxy hops, either
/// inbound-to-upstream or upstream-to-client.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(header_name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(header_name))
}

/// Picks one of a group's upstreams by weighted random selection over the
/// positive integer weights: build a cumulative distribution, draw a
/// uniform integer in `[0, total)`, binary-search for the first cumulative
/// weight exceeding it.
pub fn pick_weighted_upstream<'a>(upstreams: &'a [Upstream]) -> Result<&'a Upstream> {
    if upstreams.is_empty() {
        return Err(ProxyError::Validation("group has no upstreams".into()));
    }
    let mut cumulative: Vec<u64> = Vec::with_capacity(upstreams.len());
    let mut running = 0u64;
    for u in upstreams {
        running += u.weight as u64;
        cumulative.push(running);
    }
    let total = running;
    if total == 0 {
        return Err(ProxyError::Validation("all upstream weights are zero".into()));
    }
    let draw = rand::thread_rng().gen_range(0..total);
    let idx = cumulative
        .binary_search_by(|&cum| {
            if cum <= draw {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        })
        .unwrap_or_else(|i| i);
    Ok(&upstreams[idx])
}

/// Joins a base upstream URL with the request's tail path and query string,
/// avoiding a doubled `/`.
pub fn join_upstream_url(base: &str, tail_path: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let tail = tail_path.trim_start_matches('/');
    let mut url = if tail.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{tail}")
    };
    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    url
}

/// Tolerant scan for a streaming request, as a small substring search
/// rather than a full JSON parse — a malformed-but-harmless body should
/// never fail the request at this stage.
pub fn body_requests_stream(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains("\"stream\":true")
}

pub fn is_stream_request(body: &[u8], accept_header: Option<&str>, query: Option<&str>) -> bool {
    if body_requests_stream(body) {
        return true;
    }
    if let Some(accept) = accept_header {
        if accept.contains("text/event-stream") {
            return true;
        }
    }
    if let Some(q) = query {
        if q.split('&').any(|pair| pair == "stream=true") {
            return true;
        }
    }
    false
}

/// A pair of `reqwest::Client`s built from an `EffectiveConfig` snapshot: a
/// buffered client bounded by the overall request timeout, and a streaming
/// client with no overall timeout (only a response-header timeout), so a
/// long-lived SSE body is never killed mid-stream.
pub struct ClientPair {
    pub buffered: Client,
    pub streaming: Client,
    built_from: EffectiveConfig,
}

impl ClientPair {
    pub fn build(config: &EffectiveConfig) -> Result<Self> {
        let buffered = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_conns_per_host as usize)
            .pool_idle_timeout(Duration::from_secs(config.idle_conn_timeout_secs))
            .build()
            .map_err(|e| ProxyError::Validation(format!("failed to build http client: {e}")))?;

        let streaming = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.response_header_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_conns_per_host as usize)
            .pool_idle_timeout(Duration::from_secs(config.idle_conn_timeout_secs))
            .build()
            .map_err(|e| ProxyError::Validation(format!("failed to build streaming client: {e}")))?;

        Ok(Self { buffered, streaming, built_from: config.clone() })
    }

    pub fn is_stale(&self, current: &EffectiveConfig) -> bool {
        &self.built_from != current
    }
}

/// The result of a URL-building step: the final upstream URL plus whatever
/// extra headers the protocol's auth scheme requires (e.g. `Authorization`
/// or `x-api-key`; Gemini instead folds its key into the URL itself).
pub struct UpstreamRequest {
    pub url: String,
    pub extra_headers: Vec<(&'static str, String)>,
}

/// Protocol-specific request shaping and key validation, one implementation
/// per `ChannelType`. Instances are long-lived (held by the `AdapterRegistry`)
/// and rebuilt only when their client pair goes stale.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_type(&self) -> llmgate_types::ChannelType;

    /// Picks an upstream by weight and injects protocol auth for `key_value`.
    fn build_upstream_url(
        &self,
        group: &Group,
        tail_path: &str,
        query: Option<&str>,
        key_value: &str,
    ) -> Result<UpstreamRequest>;

    /// Whether this request should be treated as a streaming request.
    fn is_stream_request(&self, body: &[u8], accept_header: Option<&str>, query: Option<&str>) -> bool {
        is_stream_request(body, accept_header, query)
    }

    /// Probes a key's validity with a minimal completion against
    /// `group.test_model`. `Ok(true)`/`Ok(false)` are verdicts; an `Err` of
    /// `ProxyError::UpstreamTransient` means "try again later", never a
    /// verdict.
    async fn validate_key(&self, group: &Group, key_value: &str) -> Result<bool>;

    fn http_client(&self) -> &Client;
    fn streaming_client(&self) -> &Client;

    /// Whether the client pair was built from a now-stale `EffectiveConfig`
    /// and should be rebuilt by the registry.
    fn is_config_stale(&self, config: &EffectiveConfig) -> bool;
}

/// Maps a validation probe's HTTP response into the three-way verdict the
/// validator pool expects.
pub fn classify_validation_status(status: reqwest::StatusCode) -> Result<bool> {
    if status.is_success() {
        return Ok(true);
    }
    let code = status.as_u16();
    if code == 408 || code == 429 || status.is_server_error() {
        return Err(ProxyError::UpstreamTransient(format!(
            "validation probe returned {code}, treating as transient"
        )));
    }
    Ok(false)
}
