//! Redis-backed pool queues.
//!
//! # Queue Structure
//!
//! - `{prefix}:pools`: set of pool names with a queue
//! - `{prefix}:queue:{pool}`: list of JSON notifications, pushed on the left
//!   and popped from the right so the list is FIFO
//! - `{prefix}:discarded:{query_id}`: discard marker, expires after the TTL
//!
//! Sends go through a Lua script that checks the list length against the
//! capacity and pushes in one step. Each listener gets its own connection for
//! `BRPOP`, so a blocked pop never stalls other commands.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{NotificationSource, QueryTaskNotification, QueueBackend, QueueError};
use crate::model::QueryPool;

const BOUNDED_PUSH_SCRIPT: &str = r#"
if redis.call('LLEN', KEYS[1]) >= tonumber(ARGV[2]) then
  return 0
end
redis.call('LPUSH', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

fn queue_key(prefix: &str, pool: &QueryPool) -> String {
    format!("{}:queue:{}", prefix, pool)
}

/// Pool queues stored as Redis lists.
pub struct RedisQueueBackend {
    client: redis::Client,
    redis: ConnectionManager,
    prefix: String,
    push_script: Script,
}

impl RedisQueueBackend {
    /// Connects to Redis; every key is namespaced under `prefix`.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            prefix: prefix.to_string(),
            push_script: Script::new(BOUNDED_PUSH_SCRIPT),
        })
    }

    fn pools_key(&self) -> String {
        format!("{}:pools", self.prefix)
    }

    fn queue_key(&self, pool: &QueryPool) -> String {
        queue_key(&self.prefix, pool)
    }

    fn discarded_key(&self, query_id: Uuid) -> String {
        format!("{}:discarded:{}", self.prefix, query_id)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn ensure_queue(&self, pool: &QueryPool) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(self.pools_key(), pool.name()).await?;
        Ok(())
    }

    async fn delete_queue(&self, pool: &QueryPool) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.queue_key(pool))
            .srem(self.pools_key(), pool.name());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn empty_queue(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let key = self.queue_key(pool);
        let mut pipe = redis::pipe();
        pipe.atomic().llen(&key).del(&key).ignore();
        let (dropped,): (usize,) = pipe.query_async(&mut conn).await?;
        Ok(dropped)
    }

    async fn queue_size(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.queue_key(pool)).await?;
        Ok(len)
    }

    async fn try_push(
        &self,
        notification: &QueryTaskNotification,
        capacity: usize,
    ) -> Result<bool, QueueError> {
        let serialized = serde_json::to_string(notification)?;
        let mut conn = self.redis.clone();
        let pushed: i64 = self
            .push_script
            .key(self.queue_key(notification.pool()))
            .key(self.pools_key())
            .arg(serialized)
            .arg(capacity)
            .arg(notification.pool().name())
            .invoke_async(&mut conn)
            .await?;
        Ok(pushed == 1)
    }

    async fn requeue(&self, notification: &QueryTaskNotification) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(notification)?;
        let mut conn = self.redis.clone();
        // the right end is the head
        conn.rpush::<_, _, ()>(self.queue_key(notification.pool()), serialized)
            .await?;
        Ok(())
    }

    async fn discard_query(
        &self,
        pool: &QueryPool,
        query_id: Uuid,
        ttl: Duration,
    ) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(self.discarded_key(query_id))
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let key = self.queue_key(pool);
        let entries: Vec<String> = conn.lrange(&key, 0, -1).await?;
        let mut removed = 0;
        for entry in entries {
            let matches = serde_json::from_str::<QueryTaskNotification>(&entry)
                .map(|n| n.query_id() == query_id)
                .unwrap_or(false);
            if matches {
                let count: usize = conn.lrem(&key, 1, &entry).await?;
                removed += count;
            }
        }
        Ok(removed)
    }

    async fn is_discarded(&self, query_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.discarded_key(query_id)).await?;
        Ok(exists)
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let pools: Vec<String> = conn.smembers(self.pools_key()).await?;

        let mut markers = Vec::new();
        {
            let mut iter: redis::AsyncIter<String> = conn
                .scan_match(format!("{}:discarded:*", self.prefix))
                .await?;
            while let Some(key) = iter.next_item().await {
                markers.push(key);
            }
        }

        let mut pipe = redis::pipe();
        for pool in &pools {
            pipe.del(queue_key(&self.prefix, &QueryPool::from(pool.as_str())))
                .ignore();
        }
        for marker in &markers {
            pipe.del(marker).ignore();
        }
        pipe.del(self.pools_key()).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>, QueueError> {
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(RedisNotificationSource {
            conn,
            prefix: self.prefix.clone(),
        }))
    }
}

/// Listener-owned connection used for blocking pops.
struct RedisNotificationSource {
    conn: MultiplexedConnection,
    prefix: String,
}

#[async_trait]
impl NotificationSource for RedisNotificationSource {
    async fn pop(
        &mut self,
        pools: &[QueryPool],
        wait: Duration,
    ) -> Result<Option<QueryTaskNotification>, QueueError> {
        let keys: Vec<String> = pools
            .iter()
            .map(|pool| queue_key(&self.prefix, pool))
            .collect();
        if keys.is_empty() {
            return Ok(None);
        }

        let data = if wait.is_zero() {
            // BRPOP with a zero timeout would block forever
            let mut found = None;
            for key in &keys {
                let popped: Option<String> = self.conn.rpop(key, None).await?;
                if popped.is_some() {
                    found = popped;
                    break;
                }
            }
            found
        } else {
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(&keys)
                .arg(wait.as_secs_f64())
                .query_async(&mut self.conn)
                .await?;
            popped.map(|(_, data)| data)
        };

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}
