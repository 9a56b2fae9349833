//! The one HTTP surface this service exposes: `{ANY} /proxy/:group_name/*rest`.
//! Everything else — group/key/setting management, bulk import, manual
//! validation — belongs to the external control plane.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use llmgate_proxy::{ProxyContext, ResponseBody, MAX_BODY_SIZE_BYTES};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::state::AppState;

/// Header/query-param precedence for the client-facing credential, mirroring
/// each channel adapter's own placement choice but applied on the inbound
/// side: `Authorization: Bearer`, then `x-api-key`, then a `key` query param.
fn extract_client_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("x-api-key") {
        if let Ok(s) = value.to_str() {
            return Some(s.to_string());
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("key=") {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn credential_allowed(proxy_keys: &[String], credential: Option<&str>) -> bool {
    if proxy_keys.is_empty() {
        return true;
    }
    match credential {
        Some(c) => proxy_keys.iter().any(|k| k == c),
        None => false,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, Body::from(body.to_string())).into_response()
}

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path((group_name, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: axum::body::Body,
) -> Response {
    let group = match state.groups.get_by_name(&group_name) {
        Ok(g) => g,
        Err(e) => return error_response(StatusCode::NOT_FOUND, &e.to_string()),
    };

    let credential = extract_client_credential(&headers, query.as_deref());
    if !credential_allowed(&group.group.proxy_keys, credential.as_deref()) {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid proxy credential");
    }

    let body_bytes = match to_bytes(body, MAX_BODY_SIZE_BYTES).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()),
    };

    let forward_headers: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let ctx = ProxyContext {
        request_id: headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        source_ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        cancellation: CancellationToken::new(),
    };

    let response = state
        .executor
        .execute(method.as_str(), &rest, query.as_deref(), &forward_headers, body_bytes, &group, &ctx)
        .await;

    build_axum_response(response)
}

fn build_axum_response(proxy_response: llmgate_proxy::ProxyResponse) -> Response {
    let status = StatusCode::from_u16(proxy_response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &proxy_response.headers {
        builder = builder.header(name, value);
    }

    let body = match proxy_response.body {
        ResponseBody::Buffered(bytes) => Body::from(bytes),
        ResponseBody::Streaming(stream) => Body::from_stream(stream),
    };

    builder.body(body).unwrap_or_else(|e| {
        warn!(error = %e, "failed to build proxied response");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
    })
}
