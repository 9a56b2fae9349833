//! The retrying, key-rotating request executor: one call per inbound
//! request, looping across the group's active keys until a terminal
//! response is produced or retries are exhausted.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use llmgate_channels::{is_hop_by_hop, AdapterRegistry};
use llmgate_keypool::KeyPoolManager;
use llmgate_types::{GroupRecord, ProxyError, RequestLog};
use tokio::sync::mpsc::Sender;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::types::{AttemptLog, ByteStream, ProxyContext, ProxyResponse, ResponseBody};

/// Transport and protocol-level statuses that mean "the upstream is
/// currently unusable, try again" rather than "this is the answer".
const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];
const CREDENTIAL_STATUSES: &[u16] = &[401, 403];

const MAX_EXCERPT_BYTES: usize = 512;
/// Bound on the buffered request body the executor will read into memory
/// before forwarding, enabling a clean retry replay.
pub const MAX_BODY_SIZE_BYTES: usize = 10 * 1024 * 1024;

pub struct ProxyExecutor {
    key_pool: Arc<KeyPoolManager>,
    adapters: Arc<AdapterRegistry>,
    log_tx: Option<Sender<RequestLog>>,
}

impl ProxyExecutor {
    pub fn new(
        key_pool: Arc<KeyPoolManager>,
        adapters: Arc<AdapterRegistry>,
        log_tx: Option<Sender<RequestLog>>,
    ) -> Self {
        Self { key_pool, adapters, log_tx }
    }

    #[instrument(skip(self, headers, body, group, ctx), fields(group = %group.group.name))]
    pub async fn execute(
        &self,
        method: &str,
        tail_path: &str,
        query: Option<&str>,
        headers: &[(String, String)],
        body: Bytes,
        group: &GroupRecord,
        ctx: &ProxyContext,
    ) -> ProxyResponse {
        let mut response = self.execute_inner(method, tail_path, query, headers, body, group, ctx).await;
        if let Some(request_id) = &ctx.request_id {
            response.headers.push(("x-request-id".to_string(), request_id.clone()));
        }
        response
    }

    async fn execute_inner(
        &self,
        method: &str,
        tail_path: &str,
        query: Option<&str>,
        headers: &[(String, String)],
        body: Bytes,
        group: &GroupRecord,
        ctx: &ProxyContext,
    ) -> ProxyResponse {
        let started_at = chrono::Utc::now();
        let accept_header = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("accept"))
            .map(|(_, v)| v.as_str());

        let adapter = match self.adapters.get(group.group.channel_type) {
            Some(a) => a,
            None => {
                warn!("no adapter registered for channel type");
                return ProxyResponse::exhausted(None, Vec::new());
            }
        };
        let is_stream = adapter.is_stream_request(&body, accept_header, query);

        let mut attempts = Vec::new();
        let max_retries = group.effective_config.max_retries;

        for attempt in 0..=max_retries {
            if ctx.cancellation.is_cancelled() {
                break;
            }

            let key = match self.key_pool.select_next_key(group.group.id).await {
                Ok(k) => k,
                Err(ProxyError::NoActiveKeys(_)) => return ProxyResponse::no_active_keys(),
                Err(e) => {
                    warn!(error = %e, "key selection failed");
                    return ProxyResponse::exhausted(None, attempts);
                }
            };

            let upstream_req = match adapter.build_upstream_url(&group.group, tail_path, query, &key.value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "failed to build upstream url");
                    return ProxyResponse::exhausted(None, attempts);
                }
            };

            let client = if is_stream { adapter.streaming_client() } else { adapter.http_client() };
            let reqwest_method = reqwest::Method::from_bytes(method.as_bytes())
                .unwrap_or(reqwest::Method::POST);

            let mut builder = client.request(reqwest_method, &upstream_req.url).body(body.clone());
            for (name, value) in headers {
                if is_hop_by_hop(name)
                    || name.eq_ignore_ascii_case("host")
                    || name.eq_ignore_ascii_case("authorization")
                    || name.eq_ignore_ascii_case("x-proxy-group")
                {
                    continue;
                }
                builder = builder.header(name, value);
            }
            for (name, value) in &upstream_req.extra_headers {
                builder = builder.header(*name, value);
            }
            if let Some(request_id) = &ctx.request_id {
                builder = builder.header("x-request-id", request_id);
            }
            if !is_stream {
                builder = builder.timeout(std::time::Duration::from_secs(group.effective_config.request_timeout_secs));
            }

            let response = builder.send().await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let excerpt = e.to_string();
                    attempts.push(AttemptLog { attempt, key_id: Some(key.id), status: None, excerpt: excerpt.clone() });
                    let _ = self.key_pool.record_failure(key.id, group.group.id, group.effective_config.blacklist_threshold, &excerpt).await;
                    self.emit_log(ctx, group, Some(key.id), None, false, tail_path, started_at, Some(excerpt)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();

            if TRANSIENT_STATUSES.contains(&status) {
                let body_excerpt = read_excerpt(response).await;
                attempts.push(AttemptLog { attempt, key_id: Some(key.id), status: Some(status), excerpt: body_excerpt.clone() });
                let _ = self.key_pool.record_failure(key.id, group.group.id, group.effective_config.blacklist_threshold, &body_excerpt).await;
                self.emit_log(ctx, group, Some(key.id), Some(status), false, tail_path, started_at, Some(body_excerpt)).await;
                continue;
            }

            // Terminal response: forward unchanged.
            let is_success = !CREDENTIAL_STATUSES.contains(&status);
            if CREDENTIAL_STATUSES.contains(&status) {
                let _ = self
                    .key_pool
                    .record_failure(key.id, group.group.id, group.effective_config.blacklist_threshold, "credential rejected by upstream")
                    .await;
            } else if !is_stream {
                let _ = self.key_pool.record_success(key.id).await;
            }

            let mut response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
                .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
                .collect();

            if is_stream {
                response_headers.push(("x-accel-buffering".into(), "no".into()));
                let key_pool = self.key_pool.clone();
                let key_id = key.id;
                let cancellation = ctx.cancellation.clone();
                let stream: ByteStream = Box::pin(stream_with_keepalive(response, cancellation, key_pool, key_id));
                self.emit_log(ctx, group, Some(key.id), Some(status), is_success, tail_path, started_at, None).await;
                return ProxyResponse { status, headers: response_headers, body: ResponseBody::Streaming(stream) };
            }

            let body_bytes = response.bytes().await.unwrap_or_default();
            self.emit_log(ctx, group, Some(key.id), Some(status), is_success, tail_path, started_at, None).await;
            return ProxyResponse { status, headers: response_headers, body: ResponseBody::Buffered(body_bytes) };
        }

        let last_status = attempts.last().and_then(|a| a.status);
        ProxyResponse::exhausted(last_status, attempts)
    }

    async fn emit_log(
        &self,
        ctx: &ProxyContext,
        group: &GroupRecord,
        key_id: Option<i64>,
        status: Option<u16>,
        is_success: bool,
        path: &str,
        started_at: chrono::DateTime<chrono::Utc>,
        error_excerpt: Option<String>,
    ) {
        let Some(tx) = &self.log_tx else { return };
        let duration_ms = (chrono::Utc::now() - started_at).num_milliseconds().max(0) as u64;
        let log = RequestLog {
            id: Uuid::new_v4(),
            timestamp: started_at,
            group_id: group.group.id,
            key_id: key_id.unwrap_or_default(),
            key_value: String::new(),
            source_ip: ctx.source_ip.clone(),
            status_code: status.unwrap_or(0),
            is_success,
            path: path.to_string(),
            duration_ms,
            error_excerpt,
        };
        if tx.try_send(log).is_err() {
            warn!("request log channel full, dropping log entry");
        }
    }
}

async fn read_excerpt(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let n = bytes.len().min(MAX_EXCERPT_BYTES);
            String::from_utf8_lossy(&bytes[..n]).to_string()
        }
        Err(e) => e.to_string(),
    }
}

/// Forwards upstream chunks as they arrive, interleaved with a 50ms ticker
/// so the consuming transport gets a chance to flush even during gaps
/// between upstream writes. On cancellation the stream ends quietly.
fn stream_with_keepalive(
    response: reqwest::Response,
    cancellation: tokio_util::sync::CancellationToken,
    key_pool: Arc<KeyPoolManager>,
    key_id: i64,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(50));
        ticker.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!("client disconnected mid-stream, stopping quietly");
                    break;
                }
                chunk = upstream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => yield Ok(bytes),
                        Some(Err(e)) => {
                            yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                            break;
                        }
                        None => {
                            let _ = key_pool.record_success(key_id).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    continue;
                }
            }
        }
    }
}

