//! Pool-scoped notification queues and listeners.
//!
//! Every pool has one bounded FIFO queue of [`QueryTaskNotification`]s. A
//! notification only says "this task is ready"; the stored task and its lock
//! stay authoritative, so delivery is at-least-once and advisory.
//!
//! # Backends
//!
//! - [`LocalQueueBackend`]: in-process queues
//! - [`RedisQueueBackend`]: Redis lists shared by every executor process
//!
//! Listeners are created through the [`QueueManager`], which keeps an explicit
//! registry of live listeners so their pool subscriptions can be changed
//! while they poll.

pub mod distributed;
pub mod listener;
pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{QueryPool, TaskKey};

pub use self::distributed::RedisQueueBackend;
pub use self::listener::Listener;
pub use self::local::LocalQueueBackend;

/// Reference capacity of a pool queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The pool queue stayed full for the whole send window.
    #[error("Queue for pool {pool} is full ({capacity} notifications)")]
    QueueFull { pool: QueryPool, capacity: usize },

    #[error("Listener {0} already exists")]
    DuplicateListener(String),

    #[error("Listener {0} not found")]
    UnknownListener(String),

    #[error("Listener {0} has been stopped")]
    ListenerStopped(String),

    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Advisory signal that a task is ready to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTaskNotification {
    pub task_key: TaskKey,
}

impl QueryTaskNotification {
    pub fn new(task_key: TaskKey) -> Self {
        Self { task_key }
    }

    pub fn pool(&self) -> &QueryPool {
        self.task_key.query_pool()
    }

    pub fn query_id(&self) -> Uuid {
        self.task_key.query_id()
    }
}

/// What `send_message` does when the pool queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Wait up to the send timeout for space, then fail.
    #[default]
    Block,
    /// Fail immediately.
    FailFast,
}

impl fmt::Display for QueueFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueFullPolicy::Block => write!(f, "block"),
            QueueFullPolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

impl FromStr for QueueFullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(QueueFullPolicy::Block),
            "fail_fast" | "fail-fast" | "failfast" => Ok(QueueFullPolicy::FailFast),
            other => Err(format!("unknown queue full policy '{}'", other)),
        }
    }
}

/// Tunables of a `QueueManager` and its listeners.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub full_policy: QueueFullPolicy,
    pub send_timeout: Duration,
    /// Size of each listener's local buffer.
    pub listener_buffer: usize,
    /// Longest single wait of a listener's polling loop.
    pub poll_interval: Duration,
    /// Wait used by `Listener::receive`.
    pub receive_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            full_policy: QueueFullPolicy::Block,
            send_timeout: Duration::from_secs(5),
            listener_buffer: 100,
            poll_interval: Duration::from_millis(100),
            receive_wait: Duration::from_secs(1),
        }
    }
}

/// Storage strategy for pool queues.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Creates the pool queue if absent.
    async fn ensure_queue(&self, pool: &QueryPool) -> Result<(), QueueError>;

    /// Removes the pool queue and its contents.
    async fn delete_queue(&self, pool: &QueryPool) -> Result<(), QueueError>;

    /// Drops every queued notification, returning how many were dropped.
    async fn empty_queue(&self, pool: &QueryPool) -> Result<usize, QueueError>;

    async fn queue_size(&self, pool: &QueryPool) -> Result<usize, QueueError>;

    /// Appends to the tail unless the queue already holds `capacity` entries.
    ///
    /// Returns false when the queue is full.
    async fn try_push(
        &self,
        notification: &QueryTaskNotification,
        capacity: usize,
    ) -> Result<bool, QueueError>;

    /// Puts a notification back at the head of its queue, ignoring capacity.
    async fn requeue(&self, notification: &QueryTaskNotification) -> Result<(), QueueError>;

    /// Removes the query's queued notifications and remembers the query as
    /// discarded for `ttl`. Returns how many notifications were removed.
    async fn discard_query(
        &self,
        pool: &QueryPool,
        query_id: Uuid,
        ttl: Duration,
    ) -> Result<usize, QueueError>;

    async fn is_discarded(&self, query_id: Uuid) -> Result<bool, QueueError>;

    /// Drops every queue and discard marker.
    async fn clear(&self) -> Result<(), QueueError>;

    /// Opens a consumer for one listener.
    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>, QueueError>;

    /// Waits until the pool queue may have room, or `max_wait`.
    async fn wait_for_space(&self, _pool: &QueryPool, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

/// Consumer side of the queues, owned by one listener's polling loop.
#[async_trait]
pub trait NotificationSource: Send {
    /// Pops the head of the first non-empty queue among `pools`, in order,
    /// waiting up to `wait` for one to become available.
    async fn pop(
        &mut self,
        pools: &[QueryPool],
        wait: Duration,
    ) -> Result<Option<QueryTaskNotification>, QueueError>;
}

/// Pools each live listener is subscribed to.
#[derive(Debug, Default)]
pub(crate) struct Subscription {
    pools: std::sync::RwLock<Vec<QueryPool>>,
}

impl Subscription {
    pub(crate) fn new(pools: Vec<QueryPool>) -> Self {
        Self {
            pools: std::sync::RwLock::new(pools),
        }
    }

    pub(crate) fn pools(&self) -> Vec<QueryPool> {
        self.pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Pools starting at `offset`, wrapping around.
    pub(crate) fn rotated(&self, offset: usize) -> Vec<QueryPool> {
        let mut pools = self.pools();
        if !pools.is_empty() {
            let len = pools.len();
            pools.rotate_left(offset % len);
        }
        pools
    }

    fn add(&self, pool: QueryPool) -> bool {
        let mut pools = self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pools.contains(&pool) {
            return false;
        }
        pools.push(pool);
        true
    }

    fn remove(&self, pool: &QueryPool) -> bool {
        let mut pools = self
            .pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = pools.len();
        pools.retain(|p| p != pool);
        pools.len() != before
    }
}

/// Live listeners by id.
#[derive(Debug, Default)]
pub(crate) struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl ListenerRegistry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: &str, subscription: Arc<Subscription>) -> Result<(), QueueError> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(QueueError::DuplicateListener(id.to_string()));
        }
        entries.insert(id.to_string(), subscription);
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Arc<Subscription>> {
        self.entries().get(id).cloned()
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.entries().remove(id);
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Queue façade: sends notifications and hands out listeners.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    discard_ttl: Duration,
    registry: Arc<ListenerRegistry>,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Self {
        Self {
            backend,
            settings,
            discard_ttl: Duration::from_secs(24 * 60 * 60),
            registry: Arc::new(ListenerRegistry::default()),
        }
    }

    /// How long a discarded query's notifications keep being suppressed.
    pub fn with_discard_ttl(mut self, discard_ttl: Duration) -> Self {
        self.discard_ttl = discard_ttl;
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn ensure_queue_created(&self, pool: &QueryPool) -> Result<(), QueueError> {
        self.backend.ensure_queue(pool).await
    }

    /// Enqueues a notification on its pool queue.
    ///
    /// A full queue is handled according to the configured `QueueFullPolicy`;
    /// the notification is never dropped silently.
    pub async fn send_message(&self, notification: QueryTaskNotification) -> Result<(), QueueError> {
        let pool = notification.pool().clone();
        self.backend.ensure_queue(&pool).await?;

        let deadline = Instant::now() + self.settings.send_timeout;
        loop {
            if self
                .backend
                .try_push(&notification, self.settings.capacity)
                .await?
            {
                debug!(pool = %pool, task_key = %notification.task_key, "Sent task notification");
                return Ok(());
            }

            let now = Instant::now();
            if self.settings.full_policy == QueueFullPolicy::FailFast || now >= deadline {
                return Err(QueueError::QueueFull {
                    pool,
                    capacity: self.settings.capacity,
                });
            }
            let pause = (deadline - now).min(self.settings.poll_interval);
            self.backend.wait_for_space(&pool, pause).await;
        }
    }

    /// Starts a listener polling the given pools.
    pub async fn create_listener(
        &self,
        listener_id: impl Into<String>,
        pools: &[QueryPool],
    ) -> Result<Listener, QueueError> {
        let listener_id = listener_id.into();
        for pool in pools {
            self.backend.ensure_queue(pool).await?;
        }

        let subscription = Arc::new(Subscription::new(pools.to_vec()));
        self.registry.register(&listener_id, subscription.clone())?;

        let source = match self.backend.notification_source().await {
            Ok(source) => source,
            Err(e) => {
                self.registry.unregister(&listener_id);
                return Err(e);
            }
        };

        info!(listener_id = %listener_id, pools = ?pools, "Starting listener");
        Ok(Listener::start(
            listener_id,
            subscription,
            source,
            self.backend.clone(),
            self.registry.clone(),
            &self.settings,
        ))
    }

    /// Subscribes a running listener to another pool.
    pub async fn add_queue_to_listener(
        &self,
        listener_id: &str,
        pool: &QueryPool,
    ) -> Result<(), QueueError> {
        let subscription = self
            .registry
            .get(listener_id)
            .ok_or_else(|| QueueError::UnknownListener(listener_id.to_string()))?;
        self.backend.ensure_queue(pool).await?;
        if subscription.add(pool.clone()) {
            debug!(listener_id = %listener_id, pool = %pool, "Added pool to listener");
        }
        Ok(())
    }

    /// Unsubscribes a running listener from a pool.
    pub fn remove_queue_from_listener(
        &self,
        listener_id: &str,
        pool: &QueryPool,
    ) -> Result<(), QueueError> {
        let subscription = self
            .registry
            .get(listener_id)
            .ok_or_else(|| QueueError::UnknownListener(listener_id.to_string()))?;
        if subscription.remove(pool) {
            debug!(listener_id = %listener_id, pool = %pool, "Removed pool from listener");
        }
        Ok(())
    }

    /// Ids of the listeners currently running.
    pub fn listener_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    pub async fn empty_queue(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        let dropped = self.backend.empty_queue(pool).await?;
        debug!(pool = %pool, dropped, "Emptied queue");
        Ok(dropped)
    }

    pub async fn delete_queue(&self, pool: &QueryPool) -> Result<(), QueueError> {
        self.backend.delete_queue(pool).await?;
        debug!(pool = %pool, "Deleted queue");
        Ok(())
    }

    pub async fn queue_size(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        self.backend.queue_size(pool).await
    }

    /// Drops the query's pending notifications and suppresses any that are
    /// already buffered by listeners.
    pub async fn discard_query(&self, pool: &QueryPool, query_id: Uuid) -> Result<usize, QueueError> {
        let removed = self
            .backend
            .discard_query(pool, query_id, self.discard_ttl)
            .await?;
        debug!(pool = %pool, query_id = %query_id, removed, "Discarded query notifications");
        Ok(removed)
    }

    pub async fn is_discarded(&self, query_id: Uuid) -> Result<bool, QueueError> {
        self.backend.is_discarded(query_id).await
    }

    /// Drops every queue and discard marker. Listeners keep running.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.backend.clear().await
    }
}
