//! Transport-agnostic request/response shapes for the executor: the HTTP
//! framing (axum) lives in the API crate, not here.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::CancellationToken;

/// Everything the executor needs about the inbound request besides the
/// already-resolved group: the caller (the API layer) has already stripped
/// the `/proxy/{group_name}` prefix and matched the group's `proxy_keys`.
pub struct ProxyContext {
    pub request_id: Option<String>,
    pub source_ip: String,
    pub cancellation: CancellationToken,
}

/// One retry attempt, recorded for the exhaustion response body.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub key_id: Option<i64>,
    pub status: Option<u16>,
    pub excerpt: String,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl ProxyResponse {
    pub fn exhausted(last_status: Option<u16>, attempts: Vec<AttemptLog>) -> Self {
        let status = last_status.unwrap_or(502);
        let payload = serde_json::json!({ "attempts": attempts });
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: ResponseBody::Buffered(Bytes::from(payload.to_string())),
        }
    }

    pub fn no_active_keys() -> Self {
        let payload = serde_json::json!({ "error": "no active keys available for this group" });
        Self {
            status: 503,
            headers: vec![("content-type".into(), "application/json".into())],
            body: ResponseBody::Buffered(Bytes::from(payload.to_string())),
        }
    }
}
