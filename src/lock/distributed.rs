//! Redis-backed lock backend shared by every executor process.
//!
//! # Key Structure
//!
//! - `{prefix}:semaphores`: set of query ids with a semaphore
//! - `{prefix}:semaphore:{query_id}`: hash, field `max` holds the limit
//! - `{prefix}:holders:{query_id}`: sorted set of locked task ids scored by
//!   lease expiry (milliseconds, Redis server clock)
//! - `{prefix}:lock:{query_id}:{task_id}`: owner id, expiring with the lease
//!
//! Acquisition, release, renewal and semaphore removal run as Lua scripts so
//! that the holder set and the lock keys never disagree. Scripts read the
//! Redis server clock, so executors need not agree on time.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use super::{Acquire, LockBackend};
use crate::error::TaskLockError;
use crate::model::TaskKey;

const ACQUIRE_SCRIPT: &str = r#"
local max = redis.call('HGET', KEYS[1], 'max')
if not max then
  return -1
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
if redis.call('EXISTS', KEYS[3]) == 1 then
  return 0
end
if redis.call('ZCARD', KEYS[2]) >= tonumber(max) then
  return -2
end
redis.call('SET', KEYS[3], ARGV[2], 'PX', ARGV[3])
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[2])
if not holder then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 0
end
if ARGV[2] ~= '' and holder ~= ARGV[2] then
  return 0
end
redis.call('DEL', KEYS[2])
redis.call('ZREM', KEYS[1], ARGV[1])
return 1
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[2] then
  return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('PEXPIRE', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[1], now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const DELETE_SEMAPHORE_SCRIPT: &str = r#"
local tasks = redis.call('ZRANGE', KEYS[2], 0, -1)
for _, task in ipairs(tasks) do
  redis.call('DEL', ARGV[1] .. task)
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('SREM', KEYS[3], ARGV[2])
return #tasks
"#;

const AVAILABLE_SCRIPT: &str = r#"
local max = redis.call('HGET', KEYS[1], 'max')
if not max then
  return -1
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', now)
local free = tonumber(max) - redis.call('ZCARD', KEYS[2])
if free < 0 then
  return 0
end
return free
"#;

/// Semaphores and locks stored in Redis.
pub struct RedisLockBackend {
    redis: ConnectionManager,
    prefix: String,
    acquire_script: Script,
    release_script: Script,
    renew_script: Script,
    delete_semaphore_script: Script,
    available_script: Script,
}

impl RedisLockBackend {
    /// Connects to Redis; every key is namespaced under `prefix`.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, TaskLockError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TaskLockError::Backend(format!("Redis connection failed: {}", e)))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| TaskLockError::Backend(format!("Redis connection failed: {}", e)))?;
        Ok(Self::from_connection(redis, prefix))
    }

    /// Builds the backend on an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            delete_semaphore_script: Script::new(DELETE_SEMAPHORE_SCRIPT),
            available_script: Script::new(AVAILABLE_SCRIPT),
        }
    }

    fn semaphores_key(&self) -> String {
        format!("{}:semaphores", self.prefix)
    }

    fn semaphore_key(&self, query_id: Uuid) -> String {
        format!("{}:semaphore:{}", self.prefix, query_id)
    }

    fn holders_key(&self, query_id: Uuid) -> String {
        format!("{}:holders:{}", self.prefix, query_id)
    }

    fn lock_prefix(&self, query_id: Uuid) -> String {
        format!("{}:lock:{}:", self.prefix, query_id)
    }

    fn lock_key(&self, key: &TaskKey) -> String {
        format!("{}{}", self.lock_prefix(key.query_id()), key.task_id)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn create_semaphore(&self, query_id: Uuid, max_concurrency: u32) -> Result<(), TaskLockError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(self.semaphore_key(query_id), "max", max_concurrency)
            .sadd(self.semaphores_key(), query_id.to_string());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete_semaphore(&self, query_id: Uuid) -> Result<(), TaskLockError> {
        let mut conn = self.redis.clone();
        self.delete_semaphore_script
            .key(self.semaphore_key(query_id))
            .key(self.holders_key(query_id))
            .key(self.semaphores_key())
            .arg(self.lock_prefix(query_id))
            .arg(query_id.to_string())
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn semaphore_exists(&self, query_id: Uuid) -> Result<bool, TaskLockError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.semaphore_key(query_id)).await?;
        Ok(exists)
    }

    async fn queries(&self) -> Result<HashSet<Uuid>, TaskLockError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.semaphores_key()).await?;
        Ok(members
            .iter()
            .filter_map(|member| Uuid::parse_str(member).ok())
            .collect())
    }

    async fn try_acquire(
        &self,
        key: &TaskKey,
        owner: Uuid,
        lease: Duration,
    ) -> Result<Acquire, TaskLockError> {
        let mut conn = self.redis.clone();
        let query_id = key.query_id();
        let result: i64 = self
            .acquire_script
            .key(self.semaphore_key(query_id))
            .key(self.holders_key(query_id))
            .key(self.lock_key(key))
            .arg(key.task_id.to_string())
            .arg(owner.to_string())
            .arg(lease.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;

        match result {
            1 => Ok(Acquire::Acquired),
            0 => Ok(Acquire::Held),
            -1 => Err(TaskLockError::MissingSemaphore(query_id)),
            -2 => {
                let max: Option<u32> = conn.hget(self.semaphore_key(query_id), "max").await?;
                Ok(Acquire::NoPermit {
                    max_concurrency: max.unwrap_or_default(),
                })
            }
            other => Err(TaskLockError::Backend(format!(
                "unexpected acquire result {}",
                other
            ))),
        }
    }

    async fn release(&self, key: &TaskKey, owner: Option<Uuid>) -> Result<bool, TaskLockError> {
        let mut conn = self.redis.clone();
        let owner = owner.map(|o| o.to_string()).unwrap_or_default();
        let released: i64 = self
            .release_script
            .key(self.holders_key(key.query_id()))
            .key(self.lock_key(key))
            .arg(key.task_id.to_string())
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn renew(&self, key: &TaskKey, owner: Uuid, lease: Duration) -> Result<bool, TaskLockError> {
        let mut conn = self.redis.clone();
        let renewed: i64 = self
            .renew_script
            .key(self.holders_key(key.query_id()))
            .key(self.lock_key(key))
            .arg(key.task_id.to_string())
            .arg(owner.to_string())
            .arg(lease.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn holder(&self, key: &TaskKey) -> Result<Option<Uuid>, TaskLockError> {
        let mut conn = self.redis.clone();
        let owner: Option<String> = conn.get(self.lock_key(key)).await?;
        Ok(owner.and_then(|o| Uuid::parse_str(&o).ok()))
    }

    async fn available_permits(&self, query_id: Uuid) -> Result<Option<u32>, TaskLockError> {
        let mut conn = self.redis.clone();
        let free: i64 = self
            .available_script
            .key(self.semaphore_key(query_id))
            .key(self.holders_key(query_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(u32::try_from(free).ok())
    }

    async fn clear(&self) -> Result<(), TaskLockError> {
        for query_id in self.queries().await? {
            self.delete_semaphore(query_id).await?;
        }
        Ok(())
    }
}
