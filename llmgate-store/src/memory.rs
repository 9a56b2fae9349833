//! Single-node, in-process `Store`. Pub/sub only reaches local subscribers
//! (via `tokio::sync::broadcast`); `eval` is unsupported — callers fall
//! back to an exclusive critical section (a per-store `tokio::sync::Mutex`)
//! for the compound operations that would otherwise need it.

use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use llmgate_types::{ProxyError, Result};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::store::{Store, Subscription};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-process implementation of [`Store`]. Used when no `REDIS_DSN` is
/// configured; a single node is always the leader.
pub struct MemoryStore {
    kv: DashMap<String, Entry>,
    sets: DashMap<String, DashSet<String>>,
    channels: DashMap<String, broadcast::Sender<String>>,
    /// Guards the compound operations callers perform in place of `eval`.
    pub critical_section: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            kv: DashMap::new(),
            sets: DashMap::new(),
            channels: DashMap::new(),
            critical_section: Mutex::new(()),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.kv.get(key).map(|e| e.is_live()).unwrap_or(false))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let _guard = self.critical_section.lock().await;
        let occupied = self.kv.get(key).map(|e| e.is_live()).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        self.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(true)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        let set = self.sets.entry(key.to_string()).or_insert_with(DashSet::new);
        for m in members {
            set.insert(m.clone());
        }
        Ok(())
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        if let Some(set) = self.sets.get(key) {
            for m in members {
                set.remove(m);
            }
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().map(|r| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn spop_n(&self, key: &str, n: usize) -> Result<Vec<String>> {
        let Some(set) = self.sets.get(key) else {
            return Ok(Vec::new());
        };
        let popped: Vec<String> = set.iter().take(n).map(|r| r.clone()).collect();
        drop(set);
        if let Some(set) = self.sets.get(key) {
            for m in &popped {
                set.remove(m);
            }
        }
        Ok(popped)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let tx = self.channel(channel);
        let n = tx.send(payload.to_string()).unwrap_or(0);
        debug!(channel, subscribers = n, "published to local channel");
        Ok(n)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let tx = self.channel(channel);
        let rx = tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(Subscription::new(Box::pin(stream) as Pin<Box<_>>))
    }

    fn supports_eval(&self) -> bool {
        false
    }

    async fn eval(&self, _script: &str, _keys: &[String], _args: &[String]) -> Result<i64> {
        Err(ProxyError::Store(
            "eval is unsupported in single-node mode; caller must use a critical section".into(),
        ))
    }
}

use futures::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", None).await.unwrap());
        assert!(!store.set_nx("k", "b", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn spop_n_removes_and_returns_members() {
        let store = MemoryStore::new();
        store
            .sadd("s", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        let popped = store.spop_n("s", 2).await.unwrap();
        assert_eq!(popped.len(), 2);
        let remaining = store.smembers("s").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_local_subscriber() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();
        assert_eq!(sub.next().await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn eval_is_unsupported() {
        let store = MemoryStore::new();
        assert!(!store.supports_eval());
        assert!(store.eval("return 1", &[], &[]).await.is_err());
    }
}
