//! Shared application state handed to every axum handler.
//!
//! `llmgate-tasks`'s `TaskRegistry` is deliberately not wired in here: its
//! only callers (bulk key import, manual group validation) belong to the
//! control-plane HTTP API, which is an external collaborator this repo
//! doesn't implement (SPEC_FULL.md §6). It stays a complete, independently
//! tested library crate for that collaborator to construct.

use std::sync::Arc;

use llmgate_cache::GroupCache;
use llmgate_proxy::ProxyExecutor;

pub struct AppState {
    pub groups: Arc<GroupCache>,
    pub executor: Arc<ProxyExecutor>,
}
