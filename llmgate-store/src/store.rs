//! The `Store` capability trait: KV + set + pub/sub + atomic scripting.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use llmgate_types::Result;

/// A lazily-produced stream of pub/sub payloads. Finite only when the
/// publisher side closes (or, for [`crate::memory::MemoryStore`], when the
/// last sender drops).
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = String> + Send>>,
}

impl Subscription {
    pub fn new(inner: Pin<Box<dyn Stream<Item = String> + Send>>) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<String> {
        use futures::StreamExt;
        self.inner.next().await
    }
}

/// KV + set + pub/sub + atomic scripting, with two implementations:
/// [`crate::memory::MemoryStore`] (single node) and
/// [`crate::redis_store::RedisStore`] (cluster-coherent). The presence of a
/// working [`Store::eval`] (i.e. `supports_eval() == true`) is what the rest
/// of the engine uses to decide whether it is running in cluster mode.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomic "set if not exists"; returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()>;
    async fn srem(&self, key: &str, members: &[String]) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically pops up to `n` members from the set at `key`.
    async fn spop_n(&self, key: &str, n: usize) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Whether [`Store::eval`] is backed by a real atomic scripting engine.
    /// `false` for [`crate::memory::MemoryStore`]; callers that need an
    /// atomic compound operation must fall back to an in-process critical
    /// section when this is `false`.
    fn supports_eval(&self) -> bool;

    /// Evaluates a Lua script atomically against `keys`/`args`, Redis
    /// `EVAL` style. Returns `Err` when `supports_eval()` is `false`.
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64>;
}
