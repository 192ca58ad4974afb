use crate::{FieldDelta, HashBatch, MessageStream, Store, StoreMessage};
use async_trait::async_trait;
use convoy_core::{ConvoyError, ConvoyResult};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// [`Store`] backed by a Redis server.
///
/// Commands go through a reconnecting [`ConnectionManager`]; each
/// subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> ConvoyResult<Self> {
        let client = redis::Client::open(url).map_err(ConvoyError::store)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(ConvoyError::store)?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Store for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> ConvoyResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(ConvoyError::store)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ConvoyResult<Option<String>> {
        self.conn().get(key).await.map_err(ConvoyError::store)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> ConvoyResult<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
                .await
                .map_err(ConvoyError::store),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(ConvoyError::store),
        }
    }

    async fn delete(&self, key: &str) -> ConvoyResult<bool> {
        let removed: i64 = self.conn().del(key).await.map_err(ConvoyError::store)?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str, delta: i64) -> ConvoyResult<i64> {
        self.conn().incr(key, delta).await.map_err(ConvoyError::store)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ConvoyResult<()> {
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        let _: i64 = self
            .conn()
            .expire(key, secs)
            .await
            .map_err(ConvoyError::store)?;
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> ConvoyResult<i64> {
        self.conn()
            .hincr(key, field, delta)
            .await
            .map_err(ConvoyError::store)
    }

    async fn hincr_float(&self, key: &str, field: &str, delta: f64) -> ConvoyResult<f64> {
        self.conn()
            .hincr(key, field, delta)
            .await
            .map_err(ConvoyError::store)
    }

    async fn hincr_many(&self, batch: &HashBatch) -> ConvoyResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, field, delta) in batch.increments() {
            match *delta {
                FieldDelta::Int(delta) => pipe.hincr(key, field, delta).ignore(),
                FieldDelta::Float(delta) => pipe.hincr(key, field, delta).ignore(),
            };
        }
        for (key, ttl) in batch.expiries() {
            let secs = i64::try_from(ttl_secs(*ttl)).unwrap_or(i64::MAX);
            pipe.expire(key, secs).ignore();
        }
        let mut conn = self.conn();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(ConvoyError::store)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> ConvoyResult<HashMap<String, String>> {
        self.conn().hgetall(key).await.map_err(ConvoyError::store)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> ConvoyResult<()> {
        let _: i64 = self
            .conn()
            .zadd(key, member, score)
            .await
            .map_err(ConvoyError::store)?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> ConvoyResult<Option<(String, f64)>> {
        let mut popped: Vec<(String, f64)> = self
            .conn()
            .zpopmin(key, 1)
            .await
            .map_err(ConvoyError::store)?;
        Ok(popped.pop())
    }

    async fn zfirst(&self, key: &str) -> ConvoyResult<Option<(String, f64)>> {
        let mut first: Vec<(String, f64)> = self
            .conn()
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(ConvoyError::store)?;
        Ok(first.pop())
    }

    async fn zrem(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        let removed: i64 = self
            .conn()
            .zrem(key, member)
            .await
            .map_err(ConvoyError::store)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> ConvoyResult<u64> {
        self.conn().zcard(key).await.map_err(ConvoyError::store)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> ConvoyResult<u64> {
        self.conn()
            .zrembyscore(key, min, max)
            .await
            .map_err(ConvoyError::store)
    }

    async fn sadd(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        let added: i64 = self
            .conn()
            .sadd(key, member)
            .await
            .map_err(ConvoyError::store)?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> ConvoyResult<bool> {
        let removed: i64 = self
            .conn()
            .srem(key, member)
            .await
            .map_err(ConvoyError::store)?;
        Ok(removed > 0)
    }

    async fn scard(&self, key: &str) -> ConvoyResult<u64> {
        self.conn().scard(key).await.map_err(ConvoyError::store)
    }

    async fn smembers(&self, key: &str) -> ConvoyResult<Vec<String>> {
        self.conn().smembers(key).await.map_err(ConvoyError::store)
    }

    async fn publish(&self, channel: &str, payload: &str) -> ConvoyResult<usize> {
        self.conn()
            .publish(channel, payload)
            .await
            .map_err(ConvoyError::store)
    }

    async fn subscribe(&self, channels: &[String]) -> ConvoyResult<MessageStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(ConvoyError::store)?;
        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(ConvoyError::store)?;
        }
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
