//! Redis list-backed event bus.
//!
//! Each channel is a Redis list. Publishing is `LPUSH`; receiving atomically
//! moves the oldest message into `<channel>:processing` with `BRPOPLPUSH`, and
//! `ack` removes it from there. Messages left in the processing list by a
//! crashed consumer are pushed back by `recover`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ports::{BusError, EventBus};

const KEY_PREFIX: &str = "payflow:";

/// Publishes, acks and recovery share one multiplexed connection. A blocking
/// `BRPOPLPUSH` would stall every command queued behind it, so receives use a
/// dedicated connection per channel.
#[derive(Clone)]
pub struct RedisEventBus {
    redis_client: redis::Client,
    shared: Arc<Mutex<Option<MultiplexedConnection>>>,
    blocking: Arc<Mutex<HashMap<String, MultiplexedConnection>>>,
}

impl RedisEventBus {
    /// Connections are opened lazily on first use.
    pub fn new(redis_url: &str) -> Result<Self, BusError> {
        let redis_client = redis::Client::open(redis_url)?;
        Ok(Self {
            redis_client,
            shared: Arc::new(Mutex::new(None)),
            blocking: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn queue_key(channel: &str) -> String {
        format!("{}{}", KEY_PREFIX, channel)
    }

    fn processing_key(channel: &str) -> String {
        format!("{}{}:processing", KEY_PREFIX, channel)
    }

    async fn shared_connection(&self) -> Result<MultiplexedConnection, BusError> {
        let mut slot = self.shared.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.redis_client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the shared connection after a transport failure so the next
    /// call reconnects.
    async fn check_shared<T>(&self, result: Result<T, RedisError>) -> Result<T, BusError> {
        if let Err(e) = &result {
            if is_transport_error(e) {
                tracing::warn!(error = %e, "Redis connection lost; reconnecting on next call");
                *self.shared.lock().await = None;
            }
        }
        Ok(result?)
    }

    async fn blocking_connection(&self, channel: &str) -> Result<MultiplexedConnection, BusError> {
        if let Some(conn) = self.blocking.lock().await.remove(channel) {
            return Ok(conn);
        }
        Ok(self.redis_client.get_multiplexed_async_connection().await?)
    }
}

fn is_transport_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut conn = self.shared_connection().await?;
        let result: Result<(), RedisError> = conn.lpush(Self::queue_key(channel), message).await;
        self.check_shared(result).await
    }

    async fn receive(&self, channel: &str, wait: Duration) -> Result<Option<String>, BusError> {
        let mut conn = self.blocking_connection(channel).await?;
        // A zero timeout blocks forever in Redis.
        let timeout_secs = wait.as_secs().max(1);
        let message: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(Self::queue_key(channel))
            .arg(Self::processing_key(channel))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        // Only a connection that completed its command goes back to the pool.
        self.blocking.lock().await.insert(channel.to_string(), conn);
        Ok(message)
    }

    async fn ack(&self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut conn = self.shared_connection().await?;
        let result: Result<i64, RedisError> =
            conn.lrem(Self::processing_key(channel), 1, message).await;
        self.check_shared(result).await.map(|_| ())
    }

    async fn recover(&self, channel: &str) -> Result<usize, BusError> {
        let mut conn = self.shared_connection().await?;
        let mut recovered = 0;
        loop {
            let result: Result<Option<String>, RedisError> = conn
                .rpoplpush(Self::processing_key(channel), Self::queue_key(channel))
                .await;
            if self.check_shared(result).await?.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(channel, recovered, "Requeued unacknowledged messages");
        }
        Ok(recovered)
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.shared_connection().await?;
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;
        self.check_shared(result).await.map(|_| ())
    }
}
