//! Wiring root: loads `AppConfig`, constructs every subsystem, and serves
//! the thin `/proxy/:group_name/*rest` surface.

mod config;
mod repository;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use clap::Parser;
use llmgate_aggregator::RequestLogAggregator;
use llmgate_cache::{AfterLoadHook, GroupCache, InvalidateGroupsOnSettingsChange, SettingsCache};
use llmgate_channels::AdapterRegistry;
use llmgate_keypool::KeyPoolManager;
use llmgate_leader::LeaderElection;
use llmgate_proxy::ProxyExecutor;
use llmgate_store::{MemoryStore, RedisStore, Store};
use llmgate_types::{Repository, SystemSettings};
use llmgate_validator::{KeyCron, ValidatorPool};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::repository::PgRepository;
use crate::state::AppState;

/// Cascades a settings reload into both the group cache (whose
/// `EffectiveConfig`s derive from settings) and the adapter registry (whose
/// pooled clients are built from settings timeouts). `Syncer::set_hook` only
/// holds one hook, so the two teacher-style single-purpose cascades are
/// combined here rather than replacing one another.
struct CascadeSettingsChange {
    groups: Arc<GroupCache>,
    adapters: Arc<AdapterRegistry>,
}

#[async_trait::async_trait]
impl AfterLoadHook<SystemSettings> for CascadeSettingsChange {
    async fn after_load(&self, settings: &SystemSettings) {
        if let Err(e) = self.adapters.refresh(settings) {
            tracing::error!(error = %e, "failed to refresh adapter registry after settings change");
        }
        InvalidateGroupsOnSettingsChange { groups: self.groups.clone() }
            .after_load(settings)
            .await;
    }
}

fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    match (config.log_format.as_str(), &config.log_file) {
        ("json", Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open log file");
            registry.with(tracing_subscriber::fmt::layer().json().with_writer(file)).init();
        }
        ("json", None) => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        (_, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("failed to open log file");
            registry.with(tracing_subscriber::fmt::layer().with_writer(file)).init();
        }
        _ => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

fn build_cors(config: &AppConfig) -> Option<CorsLayer> {
    if !config.enable_cors {
        return None;
    }
    let mut layer = CorsLayer::new();
    layer = if config.allowed_origins.is_empty() {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    };
    if !config.allowed_methods.is_empty() {
        let methods: Vec<_> = config.allowed_methods.iter().filter_map(|m| m.parse().ok()).collect();
        layer = layer.allow_methods(methods);
    }
    if !config.allowed_headers.is_empty() {
        let headers: Vec<_> = config.allowed_headers.iter().filter_map(|h| h.parse().ok()).collect();
        layer = layer.allow_headers(headers);
    }
    Some(layer)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::parse();
    init_tracing(&config);

    info!(port = config.port, redis = config.redis_dsn.is_some(), "starting llmgate-api");

    let store: Arc<dyn Store> = match &config.redis_dsn {
        Some(dsn) => Arc::new(RedisStore::connect(dsn).await?),
        None => Arc::new(MemoryStore::default()),
    };

    let repo: Arc<dyn Repository> = Arc::new(PgRepository::connect(&config.database_dsn).await?);

    let leader = LeaderElection::start(store.clone());
    leader.is_leader().await;

    let settings_cache = Arc::new(SettingsCache::new(store.clone(), repo.clone(), Some(leader.clone())).await?);
    let groups = Arc::new(
        GroupCache::new(store.clone(), repo.clone(), settings_cache.clone(), Some(leader.clone())).await?,
    );

    let settings = repo.load_settings().await?;
    let adapters = Arc::new(AdapterRegistry::new(&settings)?);
    settings_cache
        .cascade_into(Arc::new(CascadeSettingsChange { groups: groups.clone(), adapters: adapters.clone() }))
        .await;

    let key_pool = Arc::new(KeyPoolManager::new(store.clone(), repo.clone()));

    let aggregator = RequestLogAggregator::start(
        store.clone(),
        repo.clone(),
        leader.clone(),
        settings.request_log_write_interval_minutes,
        settings.request_log_retention_days,
    );

    let executor = Arc::new(ProxyExecutor::new(key_pool.clone(), adapters.clone(), Some(aggregator.sender())));

    let validator = ValidatorPool::start(settings.key_validation_concurrency, key_pool.clone(), adapters.clone());
    let cron = KeyCron::new(groups.clone(), repo.clone(), validator.clone(), leader.clone());
    let cron_stop = tokio_util::sync::CancellationToken::new();
    let cron_handle = tokio::spawn(cron.run(Duration::from_secs(60), cron_stop.clone()));

    let app_state = Arc::new(AppState { groups, executor });

    let mut app = Router::new()
        .route("/proxy/:group_name/*rest", any(routes::proxy))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            settings.server_write_timeout_secs,
        )));
    if let Some(cors) = build_cors(&config) {
        app = app.layer(cors);
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down subsystems");
    cron_stop.cancel();
    let _ = cron_handle.await;
    let shutdown_deadline = Duration::from_secs(settings.graceful_shutdown_timeout_secs);
    validator.shutdown(shutdown_deadline).await;
    aggregator.shutdown(shutdown_deadline).await;
    leader.shutdown().await;

    info!("llmgate-api shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl+c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
