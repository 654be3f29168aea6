//! Redis-backed store.
//!
//! Plain reads and unconditional batches share one multiplexed connection.
//! Conditional batches need `WATCH`, which is connection-scoped, so each of
//! those runs on a connection of its own.

use super::{Batch, Condition, Mutation, Store, Subscription};
use crate::error::Result;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, Pipeline};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Store talking to a Redis server.
pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, connection })
    }

    fn shared(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    async fn dedicated(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn push_mutation(pipe: &mut Pipeline, mutation: &Mutation) {
    match mutation {
        Mutation::Set { key, value, ttl } => {
            pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                pipe.arg("PX").arg(millis(*ttl));
            }
        }
        Mutation::IncrBy { key, delta } => {
            pipe.cmd("INCRBY").arg(key).arg(*delta);
        }
        Mutation::Expire { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
        }
        Mutation::Persist(key) => {
            pipe.cmd("PERSIST").arg(key);
        }
        Mutation::Delete(key) => {
            pipe.cmd("DEL").arg(key);
        }
        Mutation::HashSet { key, fields } => {
            pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                pipe.arg(field).arg(value);
            }
        }
        Mutation::HashDelete { key, field } => {
            pipe.cmd("HDEL").arg(key).arg(field);
        }
        Mutation::ListLeftPush { key, value } => {
            pipe.cmd("LPUSH").arg(key).arg(value);
        }
        Mutation::ListRightPush { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value);
        }
        Mutation::ListRemove { key, count, value } => {
            pipe.cmd("LREM").arg(key).arg(*count).arg(value);
        }
        Mutation::ListTrim { key, start, stop } => {
            pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop);
        }
        Mutation::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member);
        }
        Mutation::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member);
        }
        Mutation::SortedSetAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
        }
        Mutation::SortedSetRemove { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member);
        }
    }
}

async fn condition_holds(conn: &mut MultiplexedConnection, condition: &Condition) -> Result<bool> {
    let holds = match condition {
        Condition::KeyNotExists(key) => {
            let count: i64 = redis::cmd("EXISTS").arg(key).query_async(conn).await?;
            count == 0
        }
        Condition::StringEqual { key, value } => {
            let current: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await?;
            current.as_deref() == Some(value.as_str())
        }
        Condition::HashFieldEqual { key, field, value } => {
            let current: Option<String> =
                redis::cmd("HGET").arg(key).arg(field).query_async(conn).await?;
            current.as_deref() == Some(value.as_str())
        }
        Condition::HashFieldNotExists { key, field } => {
            let exists: i64 = redis::cmd("HEXISTS")
                .arg(key)
                .arg(field)
                .query_async(conn)
                .await?;
            exists == 0
        }
    };
    Ok(holds)
}

#[async_trait::async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let ms: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.shared())
            .await?;
        // -2: no such key, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>> {
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<i64>(&mut self.shared())
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        Ok(redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        Ok(redis::cmd("RPOPLPUSH")
            .arg(source)
            .arg(destination)
            .query_async(&mut self.shared())
            .await?)
    }

    async fn execute(&self, batch: &Batch) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for mutation in batch.mutations() {
            push_mutation(&mut pipe, mutation);
        }

        if batch.conditions().is_empty() {
            pipe.query_async::<redis::Value>(&mut self.shared()).await?;
            return Ok(true);
        }

        let mut conn = self.dedicated().await?;
        let mut watch = redis::cmd("WATCH");
        for condition in batch.conditions() {
            watch.arg(condition.key());
        }
        watch.query_async::<()>(&mut conn).await?;

        for condition in batch.conditions() {
            if !condition_holds(&mut conn, condition).await? {
                debug!(key = condition.key(), "batch precondition failed");
                redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
                return Ok(false);
            }
        }

        // EXEC replies nil when a watched key changed after WATCH.
        let reply: Option<redis::Value> = pipe.query_async(&mut conn).await?;
        if reply.is_none() {
            debug!("batch aborted by a concurrent write on a watched key");
        }
        Ok(reply.is_some())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<i64>(&mut self.shared())
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().unwrap_or_default());
        Ok(messages.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_ttl_saturates_instead_of_wrapping() {
        assert_eq!(millis(Duration::MAX), u64::MAX);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 500)), u64::MAX);
    }

    #[test]
    fn sub_millisecond_ttl_rounds_up_to_one() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
    }
}
