//! Error taxonomy shared by every core crate.

use thiserror::Error;

/// Canonical error type for the request-path and key-lifecycle engine.
///
/// Every component-level error converts into one of these variants rather
/// than bubbling up its own type, so the control plane (external to this
/// crate) has a single taxonomy to map onto HTTP status codes.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Bad input to a control-plane-facing operation. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced group, key, or task does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A group has zero active keys.
    #[error("group '{0}' has no active keys")]
    NoActiveKeys(String),

    /// Network, timeout, or 408/429/5xx from an upstream. Drives retry.
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    /// A terminal 4xx (not 408/429) from an upstream. Forwarded unchanged.
    #[error("upstream terminal error: status {status}")]
    UpstreamTerminal { status: u16, body_excerpt: String },

    /// The store abstraction (KV/set/pubsub) failed.
    #[error("store error: {0}")]
    Store(String),

    /// The relational `Repository` failed.
    #[error("database error: {0}")]
    Db(String),

    /// A singleton task is already running.
    #[error("task already running")]
    TaskBusy,

    /// A cooperative cancellation fired. Never logged at error/warn level.
    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error should drive the proxy executor's retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::UpstreamTransient(_))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Store(format!("serialization error: {e}"))
    }
}
