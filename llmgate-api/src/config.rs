//! Startup configuration, populated from the environment via `clap` derive
//! + `env` attributes (mirroring `riptide-cli`'s `Cli` struct). Unlike
//! `SystemSettings`, nothing here is hot-reloadable — changing any of it
//! requires a restart.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "llmgate-api")]
#[command(about = "Multi-tenant reverse proxy for upstream LLM APIs")]
pub struct AppConfig {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Admin credential, reserved for the external control plane; the
    /// in-scope proxy surface authenticates with each group's `proxy_keys`
    /// instead.
    #[arg(long, env = "AUTH_KEY")]
    pub auth_key: Option<String>,

    #[arg(long, env = "ENABLE_CORS", default_value_t = false)]
    pub enable_cors: bool,

    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[arg(long, env = "ALLOWED_METHODS", value_delimiter = ',')]
    pub allowed_methods: Vec<String>,

    #[arg(long, env = "ALLOWED_HEADERS", value_delimiter = ',')]
    pub allowed_headers: Vec<String>,

    /// Presence enables distributed mode (`RedisStore` + cluster-aware
    /// leader election); absence runs single-node against `MemoryStore`.
    #[arg(long, env = "REDIS_DSN")]
    pub redis_dsn: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<String>,

    #[arg(long, env = "DATABASE_DSN")]
    pub database_dsn: String,
}
