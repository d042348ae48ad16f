//! The query storage service.
//!
//! `QueryStorageService` ties the task store, the lock manager and the queue
//! manager together. Receiving a task from [`QueryStorageService::get_task`]
//! means holding its lock: the caller keeps custody until it deletes the
//! task or its lease runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::database::PgTaskStore;
use super::memory::MemoryTaskStore;
use super::store::TaskStore;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{StorageError, TaskLockError};
use crate::lock::{LocalLockBackend, LockBackend, LockManager, RedisLockBackend};
use crate::metrics::StorageMetrics;
use crate::model::{
    ensure_same_query, QueryAction, QueryCheckpoint, QueryKey, QueryLifecycle, QueryParameters,
    QueryPool, QueryState, QueryStatus, QueryTask, TaskDescription, TaskKey, TaskState,
    TaskStates,
};
use crate::queue::{
    Listener, LocalQueueBackend, QueryTaskNotification, QueueBackend, QueueManager,
    RedisQueueBackend,
};

/// Storage façade used by the query intake layer and by executors.
pub struct QueryStorageService {
    store: Arc<dyn TaskStore>,
    locks: LockManager,
    queues: QueueManager,
    metrics: StorageMetrics,
}

impl QueryStorageService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        locks: LockManager,
        queues: QueueManager,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            locks,
            queues,
            metrics: StorageMetrics::new()?,
        })
    }

    /// Builds a service over existing backends, applying the timings of
    /// `config`.
    ///
    /// Services built over the same backends behave like separate executor
    /// processes sharing one deployment: each has its own lock owner id and
    /// its own listener registry.
    pub fn with_backends(
        config: &StorageConfig,
        store: Arc<dyn TaskStore>,
        lock_backend: Arc<dyn LockBackend>,
        queue_backend: Arc<dyn QueueBackend>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let locks = LockManager::new(lock_backend)
            .with_lease(config.lock_lease)
            .with_retry_interval(config.lock_retry_interval);
        let queues =
            QueueManager::new(queue_backend, config.queue_settings()).with_discard_ttl(config.discard_ttl);
        Self::new(store, locks, queues)
    }

    /// A self-contained service on in-process backends.
    pub fn local(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::with_backends(
            config,
            Arc::new(MemoryTaskStore::new()),
            Arc::new(LocalLockBackend::new()),
            Arc::new(LocalQueueBackend::new()),
        )
    }

    /// Builds the service selected by `config.backend`.
    ///
    /// The distributed backend connects to Redis and PostgreSQL and applies
    /// pending schema migrations.
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;
        match config.backend {
            BackendKind::Local => Self::local(config),
            BackendKind::Distributed => {
                let store = PgTaskStore::connect(&config.database_url, config.max_connections).await?;
                store.run_migrations().await?;
                let lock_backend = RedisLockBackend::connect(&config.redis_url, &config.key_prefix).await?;
                let queue_backend =
                    RedisQueueBackend::connect(&config.redis_url, &config.key_prefix).await?;

                info!(prefix = %config.key_prefix, "Connected distributed query storage");
                Self::with_backends(
                    config,
                    Arc::new(store),
                    Arc::new(lock_backend),
                    Arc::new(queue_backend),
                )
            }
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn metrics(&self) -> &StorageMetrics {
        &self.metrics
    }

    /// Starts a listener for notifications of the given pools.
    pub async fn create_listener(
        &self,
        listener_id: impl Into<String>,
        pools: &[QueryPool],
    ) -> Result<Listener, StorageError> {
        Ok(self.queues.create_listener(listener_id, pools).await?)
    }

    /// Stores a new query and its `CREATE` task, then notifies the pool.
    ///
    /// The semaphore is registered before anything is persisted, so the task
    /// can be locked as soon as it is visible.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty pool name or invalid parameters,
    /// `InvalidConcurrency` for a zero limit. `NotificationFailed` when the
    /// query was stored but its pool queue refused the notification; the
    /// error carries the new task key.
    pub async fn store_query(
        &self,
        pool: &QueryPool,
        params: QueryParameters,
        max_concurrency: u32,
    ) -> Result<TaskKey, StorageError> {
        if !pool.is_valid() {
            return Err(StorageError::InvalidArgument(
                "query pool name cannot be empty".to_string(),
            ));
        }
        params.validate()?;

        let query_key = QueryKey::generate(pool.clone(), params.query_logic.clone());
        let query_id = query_key.query_id;
        self.locks.create_semaphore(query_id, max_concurrency).await?;

        let task = QueryTask::new(
            QueryAction::Create,
            QueryCheckpoint::from_parameters(query_key.clone(), &params),
        );
        let task_key = task.task_key().clone();
        let status = QueryStatus::new(query_key.clone()).with_query(params);
        let mut task_states = TaskStates::new(query_key, max_concurrency);
        task_states.add_task(task_key.task_id);

        if let Err(e) = self.store.create_query(&status, &task_states, &task).await {
            if let Err(cleanup) = self.locks.delete_semaphore(query_id).await {
                warn!(query_id = %query_id, error = %cleanup, "Failed to remove semaphore of unstored query");
            }
            return Err(e.into());
        }
        self.metrics.record_task_created(QueryAction::Create);
        info!(query_id = %query_id, pool = %pool, max_concurrency, "Stored query");

        self.notify(&task_key).await?;
        Ok(task_key)
    }

    /// Stores a follow-up task of a running query and notifies its pool.
    ///
    /// # Errors
    ///
    /// `MissingSemaphore` if the query has no registered semaphore,
    /// `QueryNotFound` if the query was deleted before the task was stored,
    /// `NotificationFailed` if the task was stored but not announced.
    pub async fn create_task(
        &self,
        action: QueryAction,
        checkpoint: QueryCheckpoint,
    ) -> Result<QueryTask, StorageError> {
        let query_id = checkpoint.query_key.query_id;
        if !self.locks.semaphore_exists(query_id).await? {
            return Err(TaskLockError::MissingSemaphore(query_id).into());
        }

        let task = QueryTask::new(action, checkpoint);
        if !self.store.create_task(&task).await? {
            return Err(StorageError::QueryNotFound(query_id));
        }
        self.metrics.record_task_created(action);
        debug!(task_key = %task.task_key(), action = %action, "Created task");

        self.notify(task.task_key()).await?;
        Ok(task)
    }

    async fn notify(&self, task_key: &TaskKey) -> Result<(), StorageError> {
        self.queues
            .send_message(QueryTaskNotification::new(task_key.clone()))
            .await
            .map_err(|source| StorageError::NotificationFailed {
                task_key: task_key.clone(),
                source,
            })?;
        self.metrics.record_notification_sent();
        Ok(())
    }

    /// Locks the task and returns it, waiting up to `wait` for the lock.
    ///
    /// Returns `Ok(None)` if the task no longer exists. A returned task is
    /// held under the configured lease.
    ///
    /// # Errors
    ///
    /// `Contended` or `ConcurrencyLimit` when the lock cannot be taken within
    /// `wait`.
    pub async fn get_task(
        &self,
        task_key: &TaskKey,
        wait: Duration,
    ) -> Result<Option<QueryTask>, StorageError> {
        self.get_task_with_lease(task_key, wait, self.locks.lease()).await
    }

    /// Like [`get_task`](Self::get_task), holding the lock for `lease`.
    pub async fn get_task_with_lease(
        &self,
        task_key: &TaskKey,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<QueryTask>, StorageError> {
        if self.store.get_task(task_key).await?.is_none() {
            return Ok(None);
        }

        let lock = self.locks.get_lock(task_key.clone());
        match lock.try_lock_with_lease(wait, lease).await {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                self.metrics.record_lock_contention();
                debug!(task_key = %task_key, error = %e, "Task lock contended");
                return Err(e.into());
            }
            Err(TaskLockError::MissingSemaphore(query_id)) => {
                if self.is_gone(task_key).await? {
                    return Ok(None);
                }
                return Err(TaskLockError::MissingSemaphore(query_id).into());
            }
            Err(e) => return Err(e.into()),
        }

        // the task may have been deleted while we waited for the lock
        match self.store.get_task(task_key).await {
            Ok(Some(task)) => {
                self.metrics.record_task_fetched();
                debug!(task_key = %task_key, action = %task.action(), "Fetched task");
                Ok(Some(task))
            }
            Ok(None) => {
                lock.force_unlock().await?;
                Ok(None)
            }
            Err(e) => {
                if let Err(unlock) = lock.unlock().await {
                    warn!(task_key = %task_key, error = %unlock, "Failed to release lock after read error");
                }
                Err(e.into())
            }
        }
    }

    /// Whether the task or its query has been deleted.
    async fn is_gone(&self, task_key: &TaskKey) -> Result<bool, StorageError> {
        let query_id = task_key.query_id();
        Ok(self.store.get_task(task_key).await?.is_none()
            || self.store.get_query_status(query_id).await?.is_none()
            || self.queues.is_discarded(query_id).await?)
    }

    /// Replaces the checkpoint of a task this owner holds.
    ///
    /// The lock stays held and no notification is sent.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the checkpoint belongs to another query,
    /// `TaskNotFound` if the task is gone, `NotHeld` if this owner does not
    /// hold the task's lock.
    pub async fn checkpoint_task(
        &self,
        task_key: &TaskKey,
        checkpoint: QueryCheckpoint,
    ) -> Result<(), StorageError> {
        ensure_same_query(task_key, &checkpoint)?;

        if self.store.get_task(task_key).await?.is_none() {
            return Err(StorageError::TaskNotFound(task_key.clone()));
        }
        if !self.locks.is_held_by_owner(task_key).await? {
            return Err(TaskLockError::NotHeld(task_key.clone()).into());
        }
        if !self.store.update_checkpoint(task_key, &checkpoint).await? {
            return Err(StorageError::TaskNotFound(task_key.clone()));
        }

        self.metrics.record_checkpoint();
        debug!(task_key = %task_key, "Checkpointed task");
        Ok(())
    }

    /// Extends this owner's lease on a task by the configured lease.
    pub async fn renew_task_lease(&self, task_key: &TaskKey) -> Result<(), StorageError> {
        self.locks.get_lock(task_key.clone()).renew().await?;
        Ok(())
    }

    pub async fn is_task_locked(&self, task_key: &TaskKey) -> Result<bool, StorageError> {
        Ok(self.locks.is_locked(task_key).await?)
    }

    /// Deletes a task and releases its lock, whoever holds it.
    ///
    /// Returns whether the task existed.
    pub async fn delete_task(&self, task_key: &TaskKey) -> Result<bool, StorageError> {
        let removed = self.store.delete_task(task_key).await?;
        self.locks.get_lock(task_key.clone()).force_unlock().await?;
        if removed {
            self.metrics.record_task_deleted();
            debug!(task_key = %task_key, "Deleted task");
        }
        Ok(removed)
    }

    /// Keys of the query's outstanding tasks, oldest first.
    pub async fn get_tasks(&self, query_id: Uuid) -> Result<Vec<TaskKey>, StorageError> {
        Ok(self
            .store
            .get_tasks(query_id)
            .await?
            .iter()
            .map(|task| task.task_key().clone())
            .collect())
    }

    /// Keys of the outstanding tasks of every query in a pool.
    pub async fn get_pool_tasks(&self, pool: &QueryPool) -> Result<Vec<TaskKey>, StorageError> {
        Ok(self
            .store
            .get_pool_tasks(pool)
            .await?
            .iter()
            .map(|task| task.task_key().clone())
            .collect())
    }

    pub async fn get_task_descriptions(
        &self,
        query_id: Uuid,
    ) -> Result<Vec<TaskDescription>, StorageError> {
        Ok(self
            .store
            .get_tasks(query_id)
            .await?
            .iter()
            .map(TaskDescription::from)
            .collect())
    }

    /// Number of outstanding tasks per action. Every action is present.
    pub async fn get_task_counts(
        &self,
        query_key: &QueryKey,
    ) -> Result<BTreeMap<QueryAction, usize>, StorageError> {
        let mut counts: BTreeMap<QueryAction, usize> =
            QueryAction::ALL.iter().map(|action| (*action, 0)).collect();
        for task in self.store.get_tasks(query_key.query_id).await? {
            *counts.entry(task.action()).or_default() += 1;
        }
        Ok(counts)
    }

    /// Deletes the query's tasks, task states, status and semaphore.
    ///
    /// Pending notifications are dropped first and later ones suppressed, so
    /// no listener reports the query afterwards. Returns whether anything
    /// was stored for the query.
    pub async fn delete_query(&self, query_id: Uuid) -> Result<bool, StorageError> {
        let pool = match self.store.get_query_status(query_id).await? {
            Some(status) => Some(status.query_key.query_pool),
            None => self
                .store
                .get_tasks(query_id)
                .await?
                .first()
                .map(|task| task.task_key().query_pool().clone()),
        };

        if let Some(pool) = &pool {
            self.queues.discard_query(pool, query_id).await?;
        }
        self.locks.delete_semaphore(query_id).await?;
        let removed = self.store.delete_query(query_id).await?;

        if removed {
            self.metrics.record_query_deleted();
            info!(query_id = %query_id, "Deleted query");
        }
        Ok(removed)
    }

    /// Inserts or replaces a status record.
    pub async fn update_query_status(&self, status: &QueryStatus) -> Result<(), StorageError> {
        self.store.put_query_status(status).await?;
        debug!(query_id = %status.query_key.query_id, lifecycle = %status.lifecycle, "Updated query status");
        Ok(())
    }

    pub async fn get_query_status(&self, query_id: Uuid) -> Result<Option<QueryStatus>, StorageError> {
        Ok(self.store.get_query_status(query_id).await?)
    }

    pub async fn get_query_statuses(&self) -> Result<Vec<QueryStatus>, StorageError> {
        Ok(self.store.get_query_statuses().await?)
    }

    /// Moves an existing query to a new lifecycle state.
    ///
    /// # Errors
    ///
    /// `QueryNotFound` if there is no status record for the query.
    pub async fn update_query_state(
        &self,
        query_id: Uuid,
        lifecycle: QueryLifecycle,
    ) -> Result<QueryStatus, StorageError> {
        let status = self
            .store
            .update_query_lifecycle(query_id, lifecycle)
            .await?
            .ok_or(StorageError::QueryNotFound(query_id))?;
        debug!(query_id = %query_id, lifecycle = %lifecycle, "Updated query lifecycle");
        Ok(status)
    }

    /// Status and task states of one query.
    pub async fn get_query(&self, query_id: Uuid) -> Result<Option<QueryState>, StorageError> {
        let Some(status) = self.store.get_query_status(query_id).await? else {
            return Ok(None);
        };
        let task_states = self.store.get_task_states(query_id).await?;
        Ok(Some(QueryState::new(status, task_states)))
    }

    /// Status and task states of every query.
    pub async fn get_queries(&self) -> Result<Vec<QueryState>, StorageError> {
        let statuses = self.store.get_query_statuses().await?;
        let mut queries = Vec::with_capacity(statuses.len());
        for status in statuses {
            let task_states = self.store.get_task_states(status.query_key.query_id).await?;
            queries.push(QueryState::new(status, task_states));
        }
        Ok(queries)
    }

    pub async fn get_task_states(&self, query_id: Uuid) -> Result<Option<TaskStates>, StorageError> {
        Ok(self.store.get_task_states(query_id).await?)
    }

    /// Records a task's state.
    ///
    /// Returns `false` when a move to `Running` is refused because the query
    /// already runs its maximum number of tasks.
    ///
    /// # Errors
    ///
    /// `QueryNotFound` if the query has no task states, `TaskNotFound` if the
    /// query never had this task or it was deleted.
    pub async fn update_task_state(
        &self,
        task_key: &TaskKey,
        state: TaskState,
    ) -> Result<bool, StorageError> {
        let Some(accepted) = self.store.update_task_state(task_key, state).await? else {
            return match self.store.get_task_states(task_key.query_id()).await? {
                Some(_) => Err(StorageError::TaskNotFound(task_key.clone())),
                None => Err(StorageError::QueryNotFound(task_key.query_id())),
            };
        };
        debug!(task_key = %task_key, state = %state, accepted, "Updated task state");
        Ok(accepted)
    }

    /// Removes every query, task, lock and queue.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.clear().await?;
        self.locks.clear().await?;
        self.queues.clear().await?;
        warn!("Cleared query storage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn config() -> StorageConfig {
        StorageConfig::default()
            .with_receive_wait(Duration::from_millis(200))
            .with_listener_poll_interval(Duration::from_millis(10))
            .with_lock_retry_interval(Duration::from_millis(5))
    }

    fn params() -> QueryParameters {
        QueryParameters::new(
            "foo == bar",
            "EventQuery",
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_store_query_registers_everything() {
        let service = QueryStorageService::local(&config()).unwrap();
        let pool = QueryPool::from("testPool");
        let key = service.store_query(&pool, params(), 3).await.unwrap();

        assert!(service.locks().semaphore_exists(key.query_id()).await.unwrap());
        assert_eq!(service.queues().queue_size(&pool).await.unwrap(), 1);
        assert_eq!(service.get_tasks(key.query_id()).await.unwrap(), vec![key.clone()]);

        let status = service.get_query_status(key.query_id()).await.unwrap().unwrap();
        assert_eq!(status.lifecycle, QueryLifecycle::Created);
        assert_eq!(status.query, Some(params()));

        let states = service.get_task_states(key.query_id()).await.unwrap().unwrap();
        assert_eq!(states.max_running, 3);
        assert_eq!(states.state(&key.task_id), Some(TaskState::Ready));

        assert_eq!(service.metrics().tasks_created(QueryAction::Create), 1);
        assert_eq!(service.metrics().notifications_sent(), 1);
    }

    #[tokio::test]
    async fn test_store_query_rejects_bad_input() {
        let service = QueryStorageService::local(&config()).unwrap();

        let err = service
            .store_query(&QueryPool::from(""), params(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        let err = service
            .store_query(&QueryPool::from("pool"), params(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Lock(TaskLockError::InvalidConcurrency(0))));

        // nothing was stored for either attempt
        assert!(service.get_query_statuses().await.unwrap().is_empty());
        assert!(service.locks().get_queries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_task_round_trips_parameters() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 1)
            .await
            .unwrap();

        let task = service.get_task(&key, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(task.action(), QueryAction::Create);
        assert_eq!(task.task_key(), &key);
        assert_eq!(task.checkpoint().to_parameters().unwrap(), params());
        assert!(service.is_task_locked(&key).await.unwrap());
        assert_eq!(service.metrics().tasks_fetched(), 1);
    }

    #[tokio::test]
    async fn test_second_get_task_is_contended() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 3)
            .await
            .unwrap();

        assert!(service.get_task(&key, Duration::ZERO).await.unwrap().is_some());
        let err = service.get_task(&key, Duration::ZERO).await.unwrap_err();
        assert!(err.is_contention());
        assert_eq!(service.metrics().lock_contention(), 1);
    }

    #[tokio::test]
    async fn test_create_task_without_semaphore() {
        let service = QueryStorageService::local(&config()).unwrap();
        let query_key = QueryKey::generate("pool", "EventQuery");

        let err = service
            .create_task(QueryAction::Next, QueryCheckpoint::empty(query_key.clone()))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(
            err,
            StorageError::Lock(TaskLockError::MissingSemaphore(id)) if id == query_key.query_id
        ));
        assert_eq!(service.metrics().notifications_sent(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_matching_key_and_lock() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 3)
            .await
            .unwrap();
        let checkpoint = QueryCheckpoint::empty(key.query_key.clone()).with_property("page", 2);

        let err = service
            .checkpoint_task(&key, checkpoint.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Lock(TaskLockError::NotHeld(_))));

        let foreign = QueryCheckpoint::empty(QueryKey::generate("pool", "EventQuery"));
        let err = service.checkpoint_task(&key, foreign).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        service.get_task(&key, Duration::ZERO).await.unwrap().unwrap();
        service.checkpoint_task(&key, checkpoint.clone()).await.unwrap();
        assert_eq!(service.metrics().checkpoints(), 1);
        // still locked by us
        assert!(service.locks().is_held_by_owner(&key).await.unwrap());

        let stored = service.store().get_task(&key).await.unwrap().unwrap();
        assert_eq!(stored.checkpoint(), &checkpoint);
        assert_eq!(stored.action(), QueryAction::Create);
    }

    #[tokio::test]
    async fn test_checkpoint_of_deleted_task() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 3)
            .await
            .unwrap();
        service.get_task(&key, Duration::ZERO).await.unwrap().unwrap();
        assert!(service.delete_task(&key).await.unwrap());

        let err = service
            .checkpoint_task(&key, QueryCheckpoint::empty(key.query_key.clone()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(service.get_task(&key, Duration::ZERO).await.unwrap().is_none());
        assert!(!service.is_task_locked(&key).await.unwrap());
        assert!(!service.delete_task(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_task_with_lease_expires() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 1)
            .await
            .unwrap();

        service
            .get_task_with_lease(&key, Duration::ZERO, Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!service.is_task_locked(&key).await.unwrap());
        let err = service.renew_task_lease(&key).await.unwrap_err();
        assert!(matches!(err, StorageError::Lock(TaskLockError::NotHeld(_))));
        assert!(service.get_task(&key, Duration::ZERO).await.unwrap().is_some());
        service.renew_task_lease(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_state_and_task_counts() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 1)
            .await
            .unwrap();
        let next = service
            .create_task(QueryAction::Next, QueryCheckpoint::empty(key.query_key.clone()))
            .await
            .unwrap();

        let counts = service.get_task_counts(&key.query_key).await.unwrap();
        assert_eq!(counts.len(), QueryAction::ALL.len());
        assert_eq!(counts[&QueryAction::Create], 1);
        assert_eq!(counts[&QueryAction::Next], 1);
        assert_eq!(counts[&QueryAction::Close], 0);

        assert!(service.update_task_state(&key, TaskState::Running).await.unwrap());
        assert!(!service
            .update_task_state(next.task_key(), TaskState::Running)
            .await
            .unwrap());
        assert!(service.update_task_state(&key, TaskState::Completed).await.unwrap());
        assert!(service
            .update_task_state(next.task_key(), TaskState::Running)
            .await
            .unwrap());

        let state = service.get_query(key.query_id()).await.unwrap().unwrap();
        assert_eq!(state.query_key, key.query_key);
        assert_eq!(state.task_states.unwrap().count(TaskState::Running), 1);

        let descriptions = service.get_task_descriptions(key.query_id()).await.unwrap();
        assert_eq!(descriptions.len(), 2);
        assert_eq!(descriptions[0].parameters.get("query").map(String::as_str), Some("foo == bar"));

        let status = service
            .update_query_state(key.query_id(), QueryLifecycle::Running)
            .await
            .unwrap();
        assert_eq!(status.lifecycle, QueryLifecycle::Running);
        assert_eq!(service.get_queries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_query_updates() {
        let service = QueryStorageService::local(&config()).unwrap();
        let missing = Uuid::new_v4();

        let err = service
            .update_query_state(missing, QueryLifecycle::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QueryNotFound(id) if id == missing));

        let key = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));
        assert!(service.update_task_state(&key, TaskState::Running).await.unwrap_err().is_not_found());
        assert!(service.get_query(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_state_of_never_created_task() {
        let service = QueryStorageService::local(&config()).unwrap();
        let key = service
            .store_query(&QueryPool::from("pool"), params(), 1)
            .await
            .unwrap();

        let never_created = TaskKey::generate(key.query_key.clone());
        let err = service
            .update_task_state(&never_created, TaskState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TaskNotFound(ref k) if *k == never_created));

        // the only running slot is still free for the real task
        assert!(service.update_task_state(&key, TaskState::Running).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_task_for_query_deleted_underneath() {
        let service = QueryStorageService::local(&config()).unwrap();
        let pool = QueryPool::from("pool");
        let key = service.store_query(&pool, params(), 1).await.unwrap();

        // the query's records vanish while its semaphore is still registered
        assert!(service.store().delete_query(key.query_id()).await.unwrap());
        assert!(service.locks().semaphore_exists(key.query_id()).await.unwrap());

        let err = service
            .create_task(QueryAction::Next, QueryCheckpoint::empty(key.query_key.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::QueryNotFound(id) if id == key.query_id()));
        assert!(service.get_tasks(key.query_id()).await.unwrap().is_empty());
        assert_eq!(service.queues().queue_size(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_query_status_upserts() {
        let service = QueryStorageService::local(&config()).unwrap();
        let mut status = QueryStatus::new(QueryKey::generate("pool", "EventQuery"));
        service.update_query_status(&status).await.unwrap();

        status.fail("scan failed");
        service.update_query_status(&status).await.unwrap();

        let stored = service
            .get_query_status(status.query_key.query_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.lifecycle, QueryLifecycle::Failed);
        assert_eq!(stored.failure_message.as_deref(), Some("scan failed"));
    }

    #[tokio::test]
    async fn test_delete_query_removes_everything() {
        let service = QueryStorageService::local(&config()).unwrap();
        let pool = QueryPool::from("pool");
        let key = service.store_query(&pool, params(), 2).await.unwrap();
        service
            .create_task(QueryAction::Next, QueryCheckpoint::empty(key.query_key.clone()))
            .await
            .unwrap();
        service.get_task(&key, Duration::ZERO).await.unwrap().unwrap();

        assert!(service.delete_query(key.query_id()).await.unwrap());

        assert!(service.get_tasks(key.query_id()).await.unwrap().is_empty());
        assert!(service.get_query_status(key.query_id()).await.unwrap().is_none());
        assert!(service.get_task_states(key.query_id()).await.unwrap().is_none());
        assert!(!service.locks().semaphore_exists(key.query_id()).await.unwrap());
        assert!(!service.is_task_locked(&key).await.unwrap());
        assert_eq!(service.queues().queue_size(&pool).await.unwrap(), 0);
        assert!(service.get_task(&key, Duration::ZERO).await.unwrap().is_none());
        assert!(!service.delete_query(key.query_id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let service = QueryStorageService::local(&config()).unwrap();
        let pool = QueryPool::from("pool");
        let key = service.store_query(&pool, params(), 2).await.unwrap();

        service.clear().await.unwrap();

        assert!(service.get_query_statuses().await.unwrap().is_empty());
        assert!(service.locks().get_queries().await.unwrap().is_empty());
        assert_eq!(service.queues().queue_size(&pool).await.unwrap(), 0);
        assert!(service.get_task(&key, Duration::ZERO).await.unwrap().is_none());
    }
}
