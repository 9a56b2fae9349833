//! Redis-backed `Store`, for cluster mode. Grounded on
//! `riptide-cache::adapters::redis_coordination::RedisCoordination`: a
//! shared `MultiplexedConnection` for regular commands, and a dedicated
//! `PubSub` connection per subscription.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use llmgate_types::{ProxyError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::Mutex;
use tracing::{debug, error, instrument};

use crate::store::{Store, Subscription};

pub struct RedisStore {
    conn: Mutex<MultiplexedConnection>,
    client: Client,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| ProxyError::Store(format!("failed to open redis client: {e}")))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ProxyError::Store(format!("failed to connect to redis: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
            client,
        })
    }
}

fn redis_err(e: redis::RedisError) -> ProxyError {
    ProxyError::Store(e.to_string())
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        conn.get(key).await.map_err(redis_err)
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        match ttl {
            Some(d) => conn
                .set_ex::<_, _, ()>(key, value, d.as_secs().max(1))
                .await
                .map_err(redis_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(redis_err),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.del::<_, ()>(key).await.map_err(redis_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        conn.exists(key).await.map_err(redis_err)
    }

    #[instrument(skip(self, value))]
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.unwrap_or(Duration::from_secs(30)).as_secs().max(1))
            .query_async::<_, Option<String>>(&mut *conn)
            .await
            .map_err(redis_err)?
            .is_some();
        Ok(set)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        conn.sadd::<_, _, ()>(key, members).await.map_err(redis_err)
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        conn.srem::<_, _, ()>(key, members).await.map_err(redis_err)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        conn.smembers(key).await.map_err(redis_err)
    }

    async fn spop_n(&self, key: &str, n: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        conn.spop_multiple(key, n).await.map_err(redis_err)
    }

    #[instrument(skip(self, payload))]
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let count: usize = conn.publish(channel, payload).await.map_err(redis_err)?;
        debug!(subscribers = count, "published");
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(redis_err)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(redis_err)?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Subscription::new(Box::pin(stream) as Pin<Box<_>>))
    }

    fn supports_eval(&self) -> bool {
        true
    }

    #[instrument(skip(self, script))]
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<i64> {
        let mut invocation_owner = Script::new(script);
        let mut invocation = invocation_owner.prepare_invoke();
        for k in keys {
            invocation.key(k);
        }
        for a in args {
            invocation.arg(a);
        }
        let mut conn = self.conn.lock().await;
        invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                error!(error = %e, "eval script failed");
                redis_err(e)
            })
    }
}
