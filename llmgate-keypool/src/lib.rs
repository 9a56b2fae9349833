//! Per-group active-key pool: fair rotation, atomic status transitions,
//! and write-through between the `Repository` and the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use llmgate_store::{scripts, Store};
use llmgate_types::{
    key::{parse_keys_text, validate_key_format},
    ApiKey, KeyStatus, ProxyError, Repository, Result,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

fn active_set_key(group_id: i64) -> String {
    format!("group:{group_id}:active")
}

fn key_record_key(key_id: i64) -> String {
    format!("key:{key_id}")
}

/// Outcome of `add_keys`, per the `POST /api/keys` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddKeysOutcome {
    pub added: usize,
    pub ignored: usize,
    pub total_in_group: usize,
}

pub struct KeyPoolManager {
    store: Arc<dyn Store>,
    repo: Arc<dyn Repository>,
    /// Per-group round-robin cursor; no lock, per SPEC_FULL.md §9.
    counters: DashMap<i64, AtomicU64>,
    /// Per-key-id exclusive section used in single-node mode in place of
    /// `Store::eval`, per SPEC_FULL.md §5.
    critical_sections: DashMap<i64, Arc<Mutex<()>>>,
}

impl KeyPoolManager {
    pub fn new(store: Arc<dyn Store>, repo: Arc<dyn Repository>) -> Self {
        Self {
            store,
            repo,
            counters: DashMap::new(),
            critical_sections: DashMap::new(),
        }
    }

    fn critical_section(&self, key_id: i64) -> Arc<Mutex<()>> {
        self.critical_sections
            .entry(key_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_key(&self, key_id: i64) -> Result<ApiKey> {
        let raw = self
            .store
            .get(&key_record_key(key_id))
            .await?
            .ok_or_else(|| ProxyError::NotFound(format!("key {key_id} not found")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_key(&self, key: &ApiKey) -> Result<()> {
        self.repo.update_key_status(key.id, key).await?;
        let raw = serde_json::to_string(key)?;
        self.store.set(&key_record_key(key.id), &raw, None).await
    }

    /// Reads a key's current store-side record, e.g. for an admin "view
    /// key" surface that wants the live value rather than a stale DB read.
    pub async fn get_key(&self, key_id: i64) -> Result<ApiKey> {
        self.load_key(key_id).await
    }

    /// Picks the next active key for `group_id` by round-robin. Members
    /// are sorted numerically before indexing so the rotation is
    /// deterministic across calls, not an artifact of set iteration order.
    pub async fn select_next_key(&self, group_id: i64) -> Result<ApiKey> {
        let mut members: Vec<i64> = self
            .store
            .smembers(&active_set_key(group_id))
            .await?
            .into_iter()
            .filter_map(|m| m.parse::<i64>().ok())
            .collect();
        if members.is_empty() {
            return Err(ProxyError::NoActiveKeys(group_id.to_string()));
        }
        members.sort_unstable();

        let counter = self
            .counters
            .entry(group_id)
            .or_insert_with(|| AtomicU64::new(0));
        let idx = (counter.fetch_add(1, Ordering::Relaxed) as usize) % members.len();
        let key_id = members[idx];
        self.load_key(key_id).await
    }

    /// Increments the request counter, clears the last error, and resets
    /// the consecutive-failure streak. Never changes status.
    pub async fn record_success(&self, key_id: i64) -> Result<()> {
        let mut key = self.load_key(key_id).await?;
        key.request_count += 1;
        key.consecutive_failures = 0;
        key.last_error = None;
        key.last_used_at = Some(Utc::now());
        self.save_key(&key).await
    }

    /// Atomically bumps the failure counters and, once the consecutive
    /// streak reaches `blacklist_threshold` (0 disables blacklisting),
    /// transitions the key to `invalid` and removes it from the active
    /// set. Distributed mode uses `Store::eval`; single-node mode uses a
    /// per-key critical section around the same read-modify-write.
    pub async fn record_failure(
        &self,
        key_id: i64,
        group_id: i64,
        blacklist_threshold: u32,
        reason: &str,
    ) -> Result<()> {
        if self.store.supports_eval() {
            let outcome = self
                .store
                .eval(
                    scripts::RECORD_FAILURE_TRANSITION,
                    &[key_record_key(key_id), active_set_key(group_id)],
                    &[
                        key_id.to_string(),
                        blacklist_threshold.to_string(),
                        reason.to_string(),
                    ],
                )
                .await?;
            if outcome < 0 {
                return Err(ProxyError::NotFound(format!("key {key_id} not found")));
            }
            if outcome == 1 {
                // The script already flipped the store's copy to `invalid`;
                // mirror that into the `Repository` so the next full reload
                // (e.g. group cache invalidation) agrees with the store.
                let updated = self.load_key(key_id).await?;
                self.repo.update_key_status(key_id, &updated).await?;
                warn!(key_id, group_id, "key blacklisted after consecutive failures");
            }
            return Ok(());
        }

        let lock = self.critical_section(key_id);
        let _guard = lock.lock().await;
        let mut key = self.load_key(key_id).await?;
        key.request_count += 1;
        key.failure_count += 1;
        key.consecutive_failures += 1;
        key.last_error = Some(reason.to_string());
        if blacklist_threshold > 0 && key.consecutive_failures >= blacklist_threshold {
            key.status = KeyStatus::Invalid;
            self.store
                .srem(&active_set_key(group_id), &[key_id.to_string()])
                .await?;
            warn!(key_id, group_id, "key blacklisted after consecutive failures");
        }
        self.save_key(&key).await
    }

    /// Restores a single key to `active`, clearing its error and
    /// consecutive-failure streak. Cumulative counters are untouched.
    pub async fn restore_key(&self, key_id: i64, group_id: i64) -> Result<()> {
        let mut key = self.load_key(key_id).await?;
        key.status = KeyStatus::Active;
        key.last_error = None;
        key.consecutive_failures = 0;
        self.save_key(&key).await?;
        self.store
            .sadd(&active_set_key(group_id), &[key_id.to_string()])
            .await
    }

    /// Restores every inactive key in a group.
    pub async fn restore_all(&self, group_id: i64) -> Result<usize> {
        let keys = self.repo.list_keys_for_group(group_id).await?;
        let mut restored = 0;
        for key in keys.into_iter().filter(|k| k.status == KeyStatus::Invalid) {
            self.restore_key(key.id, group_id).await?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Deletes every inactive key in a group.
    pub async fn clear_invalid(&self, group_id: i64) -> Result<usize> {
        let keys = self.repo.list_keys_for_group(group_id).await?;
        let invalid: Vec<i64> = keys
            .iter()
            .filter(|k| k.status == KeyStatus::Invalid)
            .map(|k| k.id)
            .collect();
        if invalid.is_empty() {
            return Ok(0);
        }
        self.repo.delete_keys(group_id, &invalid).await?;
        for id in &invalid {
            self.store.del(&key_record_key(*id)).await?;
        }
        Ok(invalid.len())
    }

    /// Parses `keys_text`, validates format, dedupes against the group's
    /// existing keys, and write-throughs the new ones: `Repository` first,
    /// then the store's hash + active set.
    pub async fn add_keys(
        &self,
        group_id: i64,
        keys_text: &str,
        next_id: impl Fn() -> i64,
    ) -> Result<AddKeysOutcome> {
        let parsed = parse_keys_text(keys_text)?;
        let existing = self.repo.list_keys_for_group(group_id).await?;
        let existing_values: std::collections::HashSet<String> =
            existing.iter().map(|k| k.value.clone()).collect();

        let mut to_insert = Vec::new();
        let mut ignored = 0usize;
        let mut seen_this_batch = std::collections::HashSet::new();
        for value in parsed {
            if validate_key_format(&value).is_err()
                || existing_values.contains(&value)
                || !seen_this_batch.insert(value.clone())
            {
                ignored += 1;
                continue;
            }
            to_insert.push(ApiKey::new(next_id(), group_id, value));
        }

        if !to_insert.is_empty() {
            self.repo.insert_keys(&to_insert).await?;
            let ids: Vec<String> = to_insert.iter().map(|k| k.id.to_string()).collect();
            self.store.sadd(&active_set_key(group_id), &ids).await?;
            for key in &to_insert {
                let raw = serde_json::to_string(key)?;
                self.store.set(&key_record_key(key.id), &raw, None).await?;
            }
        }

        info!(
            group_id,
            added = to_insert.len(),
            ignored,
            "processed add_keys request"
        );

        Ok(AddKeysOutcome {
            added: to_insert.len(),
            ignored,
            total_in_group: existing_values.len() + to_insert.len(),
        })
    }

    /// Deletes the given keys from the group's persistent rows and set.
    pub async fn remove_keys(&self, group_id: i64, key_ids: &[i64]) -> Result<()> {
        self.repo.delete_keys(group_id, key_ids).await?;
        let ids: Vec<String> = key_ids.iter().map(|id| id.to_string()).collect();
        self.store.srem(&active_set_key(group_id), &ids).await?;
        for id in key_ids {
            self.store.del(&key_record_key(*id)).await?;
        }
        Ok(())
    }
}
