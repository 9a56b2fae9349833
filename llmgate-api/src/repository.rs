//! Postgres-backed `Repository`. The schema and its migrations live
//! outside this workspace (SPEC_FULL.md's stated Non-goal); this module
//! only issues the raw SQL a running deployment's tables are expected to
//! satisfy, the same way the teacher's outbox publisher queries an assumed
//! `outbox` table without owning its migration.
//!
//! Expected tables: `groups`, `api_keys`, `system_settings` (key/value,
//! matching `SystemSettings::apply_override`), `request_logs`,
//! `group_hourly_stats`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmgate_types::{
    ApiKey, ChannelType, Group, GroupConfigOverrides, KeyStatus, LogBatch, ProxyError, Repository,
    Result, SystemSettings, Upstream,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(|e| ProxyError::Db(e.to_string()))?;
        Ok(Self { pool })
    }
}

fn db_err(e: sqlx::Error) -> ProxyError {
    ProxyError::Db(e.to_string())
}

fn channel_type_from_str(s: &str) -> Result<ChannelType> {
    match s {
        "openai" => Ok(ChannelType::OpenAi),
        "gemini" => Ok(ChannelType::Gemini),
        "anthropic" => Ok(ChannelType::Anthropic),
        other => Err(ProxyError::Db(format!("unknown channel_type '{other}' in groups row"))),
    }
}

fn key_status_from_str(s: &str) -> Result<KeyStatus> {
    match s {
        "active" => Ok(KeyStatus::Active),
        "invalid" => Ok(KeyStatus::Invalid),
        other => Err(ProxyError::Db(format!("unknown status '{other}' in api_keys row"))),
    }
}

fn group_from_row(row: &sqlx::postgres::PgRow) -> Result<Group> {
    let upstreams: serde_json::Value = row.try_get("upstreams").map_err(db_err)?;
    let config: serde_json::Value = row.try_get("config").map_err(db_err)?;
    let param_overrides: serde_json::Value = row.try_get("param_overrides").map_err(db_err)?;
    let proxy_keys: serde_json::Value = row.try_get("proxy_keys").map_err(db_err)?;

    Ok(Group {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        channel_type: channel_type_from_str(row.try_get("channel_type").map_err(db_err)?)?,
        upstreams: serde_json::from_value::<Vec<Upstream>>(upstreams).map_err(|e| ProxyError::Db(e.to_string()))?,
        test_model: row.try_get("test_model").map_err(db_err)?,
        validation_path: row.try_get("validation_path").map_err(db_err)?,
        config: serde_json::from_value::<GroupConfigOverrides>(config).map_err(|e| ProxyError::Db(e.to_string()))?,
        param_overrides: serde_json::from_value(param_overrides).map_err(|e| ProxyError::Db(e.to_string()))?,
        proxy_keys: serde_json::from_value(proxy_keys).map_err(|e| ProxyError::Db(e.to_string()))?,
        last_validated_at: row.try_get("last_validated_at").map_err(db_err)?,
    })
}

fn key_from_row(row: &sqlx::postgres::PgRow) -> Result<ApiKey> {
    let request_count: i64 = row.try_get("request_count").map_err(db_err)?;
    let failure_count: i64 = row.try_get("failure_count").map_err(db_err)?;
    let consecutive_failures: i32 = row.try_get("consecutive_failures").map_err(db_err)?;
    Ok(ApiKey {
        id: row.try_get("id").map_err(db_err)?,
        group_id: row.try_get("group_id").map_err(db_err)?,
        value: row.try_get("value").map_err(db_err)?,
        status: key_status_from_str(row.try_get("status").map_err(db_err)?)?,
        request_count: request_count as u64,
        failure_count: failure_count as u64,
        consecutive_failures: consecutive_failures as u32,
        last_used_at: row.try_get("last_used_at").map_err(db_err)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(group_from_row).collect()
    }

    async fn get_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let row = sqlx::query("SELECT * FROM groups WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn upsert_group(&self, group: &Group) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO groups (id, name, display_name, channel_type, upstreams, test_model, validation_path, config, param_overrides, proxy_keys, last_validated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                display_name = EXCLUDED.display_name,
                channel_type = EXCLUDED.channel_type,
                upstreams = EXCLUDED.upstreams,
                test_model = EXCLUDED.test_model,
                validation_path = EXCLUDED.validation_path,
                config = EXCLUDED.config,
                param_overrides = EXCLUDED.param_overrides,
                proxy_keys = EXCLUDED.proxy_keys,
                last_validated_at = EXCLUDED.last_validated_at
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(&group.display_name)
        .bind(group.channel_type.as_str())
        .bind(serde_json::to_value(&group.upstreams).map_err(|e| ProxyError::Db(e.to_string()))?)
        .bind(&group.test_model)
        .bind(&group.validation_path)
        .bind(serde_json::to_value(&group.config).map_err(|e| ProxyError::Db(e.to_string()))?)
        .bind(serde_json::to_value(&group.param_overrides).map_err(|e| ProxyError::Db(e.to_string()))?)
        .bind(serde_json::to_value(&group.proxy_keys).map_err(|e| ProxyError::Db(e.to_string()))?)
        .bind(group.last_validated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_group(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_group_last_validated(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE groups SET last_validated_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_keys_for_group(&self, group_id: i64) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(key_from_row).collect()
    }

    async fn insert_keys(&self, keys: &[ApiKey]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO api_keys (id, group_id, value, status, request_count, failure_count, consecutive_failures, last_used_at, last_error)
                VALUES ($1, $2, $3, $4, 0, 0, 0, NULL, NULL)
                ON CONFLICT (group_id, value) DO NOTHING
                "#,
            )
            .bind(key.id)
            .bind(key.group_id)
            .bind(&key.value)
            .bind("active")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_keys(&self, group_id: i64, key_ids: &[i64]) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE group_id = $1 AND id = ANY($2)")
            .bind(group_id)
            .bind(key_ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_key_status(&self, key_id: i64, status_update: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE api_keys SET
                status = $1,
                request_count = $2,
                failure_count = $3,
                consecutive_failures = $4,
                last_used_at = $5,
                last_error = $6
            WHERE id = $7
            "#,
        )
        .bind(match status_update.status {
            KeyStatus::Active => "active",
            KeyStatus::Invalid => "invalid",
        })
        .bind(status_update.request_count as i64)
        .bind(status_update.failure_count as i64)
        .bind(status_update.consecutive_failures as i32)
        .bind(status_update.last_used_at)
        .bind(&status_update.last_error)
        .bind(key_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_settings(&self) -> Result<SystemSettings> {
        let rows = sqlx::query("SELECT key, value FROM system_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut settings = SystemSettings::default();
        for row in rows {
            let key: String = row.try_get("key").map_err(db_err)?;
            let value: String = row.try_get("value").map_err(db_err)?;
            settings.apply_override(&key, &value)?;
        }
        Ok(settings)
    }

    async fn upsert_setting(&self, key: &str, raw_value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(raw_value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn apply_log_batch(&self, batch: &LogBatch) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for log in &batch.logs {
            sqlx::query(
                r#"
                INSERT INTO request_logs (id, timestamp, group_id, key_id, key_value, source_ip, status_code, is_success, path, duration_ms, error_excerpt)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(log.id)
            .bind(log.timestamp)
            .bind(log.group_id)
            .bind(log.key_id)
            .bind(&log.key_value)
            .bind(&log.source_ip)
            .bind(log.status_code as i32)
            .bind(log.is_success)
            .bind(&log.path)
            .bind(log.duration_ms as i64)
            .bind(&log.error_excerpt)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if !batch.key_counter_deltas.is_empty() {
            let ids: Vec<i64> = batch.key_counter_deltas.iter().map(|(id, _, _)| *id).collect();
            let request_deltas: Vec<i64> = batch.key_counter_deltas.iter().map(|(_, r, _)| *r as i64).collect();
            let failure_deltas: Vec<i64> = batch.key_counter_deltas.iter().map(|(_, _, f)| *f as i64).collect();
            sqlx::query(
                r#"
                UPDATE api_keys SET
                    request_count = api_keys.request_count + v.request_delta,
                    failure_count = api_keys.failure_count + v.failure_delta
                FROM (SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::bigint[])
                      AS v(id, request_delta, failure_delta)) AS v
                WHERE api_keys.id = v.id
                "#,
            )
            .bind(&ids)
            .bind(&request_deltas)
            .bind(&failure_deltas)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for stat in &batch.hourly_upserts {
            sqlx::query(
                r#"
                INSERT INTO group_hourly_stats (hour, group_id, success_count, failure_count)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (hour, group_id) DO UPDATE SET
                    success_count = group_hourly_stats.success_count + EXCLUDED.success_count,
                    failure_count = group_hourly_stats.failure_count + EXCLUDED.failure_count
                "#,
            )
            .bind(stat.hour)
            .bind(stat.group_id)
            .bind(stat.success_count as i64)
            .bind(stat.failure_count as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_logs_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM request_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
