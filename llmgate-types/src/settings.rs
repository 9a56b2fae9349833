//! System settings and the static metadata table that replaces the
//! source's reflection-driven settings dispatch (see SPEC_FULL.md §9).

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// The declared type of a setting, for validation and encode/decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    UInt,
    Bool,
    String,
}

/// One row of the static settings metadata table.
#[derive(Debug, Clone, Copy)]
pub struct SettingMeta {
    pub key: &'static str,
    pub kind: SettingKind,
    pub category: &'static str,
    pub description: &'static str,
    /// Minimum value for `UInt` settings; ignored otherwise.
    pub min: u64,
}

/// Declarative table of every writable `SystemSettings` field. Replaces
/// the tag-driven reflection the source used to build the `GET /api/settings`
/// response and to validate `PUT /api/settings` payloads.
pub const SETTINGS_METADATA: &[SettingMeta] = &[
    SettingMeta {
        key: "blacklist_threshold",
        kind: SettingKind::UInt,
        category: "keys",
        description: "Consecutive failures before a key is blacklisted (0 = never).",
        min: 0,
    },
    SettingMeta {
        key: "max_retries",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Maximum key-rotation retries per request.",
        min: 0,
    },
    SettingMeta {
        key: "server_read_timeout_secs",
        kind: SettingKind::UInt,
        category: "server",
        description: "HTTP server read timeout.",
        min: 0,
    },
    SettingMeta {
        key: "server_write_timeout_secs",
        kind: SettingKind::UInt,
        category: "server",
        description: "HTTP server write timeout.",
        min: 0,
    },
    SettingMeta {
        key: "server_idle_timeout_secs",
        kind: SettingKind::UInt,
        category: "server",
        description: "HTTP server idle-connection timeout.",
        min: 0,
    },
    SettingMeta {
        key: "graceful_shutdown_timeout_secs",
        kind: SettingKind::UInt,
        category: "server",
        description: "Grace period for in-flight requests on shutdown.",
        min: 0,
    },
    SettingMeta {
        key: "request_timeout_secs",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Per-attempt upstream request timeout for buffered requests.",
        min: 1,
    },
    SettingMeta {
        key: "connect_timeout_secs",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Upstream TCP connect timeout.",
        min: 1,
    },
    SettingMeta {
        key: "response_header_timeout_secs",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Time to wait for upstream response headers (streaming requests).",
        min: 1,
    },
    SettingMeta {
        key: "idle_conn_timeout_secs",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Idle pooled-connection timeout.",
        min: 1,
    },
    SettingMeta {
        key: "max_idle_conns",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Maximum idle connections across all hosts.",
        min: 1,
    },
    SettingMeta {
        key: "max_idle_conns_per_host",
        kind: SettingKind::UInt,
        category: "proxy",
        description: "Maximum idle connections per upstream host.",
        min: 1,
    },
    SettingMeta {
        key: "key_validation_interval_minutes",
        kind: SettingKind::UInt,
        category: "validation",
        description: "Minutes between scheduled key re-validations per group.",
        min: 1,
    },
    SettingMeta {
        key: "key_validation_concurrency",
        kind: SettingKind::UInt,
        category: "validation",
        description: "Worker pool size for the key validator.",
        min: 1,
    },
    SettingMeta {
        key: "request_log_retention_days",
        kind: SettingKind::UInt,
        category: "logging",
        description: "Days a request log row is retained before GC.",
        min: 1,
    },
    SettingMeta {
        key: "request_log_write_interval_minutes",
        kind: SettingKind::UInt,
        category: "logging",
        description: "Minutes between aggregator flushes (0 = synchronous writes).",
        min: 0,
    },
    SettingMeta {
        key: "app_url",
        kind: SettingKind::String,
        category: "general",
        description: "Externally reachable base URL of this deployment.",
        min: 0,
    },
];

/// Singleton of global tunables. Defaults match the metadata table's
/// implicit defaults below; every field has a declared type and minimum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSettings {
    pub blacklist_threshold: u32,
    pub max_retries: u32,
    pub server_read_timeout_secs: u64,
    pub server_write_timeout_secs: u64,
    pub server_idle_timeout_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub response_header_timeout_secs: u64,
    pub idle_conn_timeout_secs: u64,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub key_validation_interval_minutes: u32,
    pub key_validation_concurrency: usize,
    pub request_log_retention_days: u32,
    pub request_log_write_interval_minutes: u32,
    pub app_url: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            blacklist_threshold: 3,
            max_retries: 2,
            server_read_timeout_secs: 30,
            server_write_timeout_secs: 30,
            server_idle_timeout_secs: 120,
            graceful_shutdown_timeout_secs: 30,
            request_timeout_secs: 60,
            connect_timeout_secs: 10,
            response_header_timeout_secs: 30,
            idle_conn_timeout_secs: 90,
            max_idle_conns: 100,
            max_idle_conns_per_host: 20,
            key_validation_interval_minutes: 30,
            key_validation_concurrency: 8,
            request_log_retention_days: 30,
            request_log_write_interval_minutes: 1,
            app_url: "http://localhost:8080".into(),
        }
    }
}

impl SystemSettings {
    /// Applies one `(key, raw_value)` override onto this settings struct,
    /// dispatching on the static metadata table instead of reflection.
    /// Unknown keys or values below the declared minimum are rejected.
    pub fn apply_override(&mut self, key: &str, raw_value: &str) -> Result<()> {
        let meta = SETTINGS_METADATA
            .iter()
            .find(|m| m.key == key)
            .ok_or_else(|| ProxyError::Validation(format!("unknown setting '{key}'")))?;

        match meta.kind {
            SettingKind::UInt => {
                let value: u64 = raw_value
                    .parse()
                    .map_err(|_| ProxyError::Validation(format!("'{key}' must be an integer")))?;
                if value < meta.min {
                    return Err(ProxyError::Validation(format!(
                        "'{key}' must be >= {}",
                        meta.min
                    )));
                }
                self.set_uint(key, value)
            }
            SettingKind::Bool => Err(ProxyError::Validation(format!(
                "'{key}' is declared bool but no bool settings are currently defined"
            ))),
            SettingKind::String => self.set_string(key, raw_value.to_string()),
        }
    }

    fn set_uint(&mut self, key: &str, value: u64) -> Result<()> {
        match key {
            "blacklist_threshold" => self.blacklist_threshold = value as u32,
            "max_retries" => self.max_retries = value as u32,
            "server_read_timeout_secs" => self.server_read_timeout_secs = value,
            "server_write_timeout_secs" => self.server_write_timeout_secs = value,
            "server_idle_timeout_secs" => self.server_idle_timeout_secs = value,
            "graceful_shutdown_timeout_secs" => self.graceful_shutdown_timeout_secs = value,
            "request_timeout_secs" => self.request_timeout_secs = value,
            "connect_timeout_secs" => self.connect_timeout_secs = value,
            "response_header_timeout_secs" => self.response_header_timeout_secs = value,
            "idle_conn_timeout_secs" => self.idle_conn_timeout_secs = value,
            "max_idle_conns" => self.max_idle_conns = value as usize,
            "max_idle_conns_per_host" => self.max_idle_conns_per_host = value as usize,
            "key_validation_interval_minutes" => {
                self.key_validation_interval_minutes = value as u32
            }
            "key_validation_concurrency" => self.key_validation_concurrency = value as usize,
            "request_log_retention_days" => self.request_log_retention_days = value as u32,
            "request_log_write_interval_minutes" => {
                self.request_log_write_interval_minutes = value as u32
            }
            _ => return Err(ProxyError::Validation(format!("'{key}' is not a uint setting"))),
        }
        Ok(())
    }

    fn set_string(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "app_url" => self.app_url = value,
            _ => return Err(ProxyError::Validation(format!("'{key}' is not a string setting"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_known_override() {
        let mut s = SystemSettings::default();
        s.apply_override("max_retries", "5").unwrap();
        assert_eq!(s.max_retries, 5);
    }

    #[test]
    fn rejects_unknown_key() {
        let mut s = SystemSettings::default();
        assert!(s.apply_override("not_a_setting", "1").is_err());
    }

    #[test]
    fn rejects_below_minimum() {
        let mut s = SystemSettings::default();
        assert!(s.apply_override("request_timeout_secs", "0").is_err());
    }

    #[test]
    fn metadata_table_has_no_duplicate_keys() {
        let mut keys: Vec<&str> = SETTINGS_METADATA.iter().map(|m| m.key).collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }
}
