//! Per-query semaphores and per-task exclusive locks.
//!
//! A query's semaphore bounds how many of its tasks may be locked at the same
//! time. A task lock is exclusive custody of one task, held by one owner (an
//! executor process, identified by the owner id of its `LockManager`) until
//! it is released or its lease expires.
//!
//! # Backends
//!
//! - [`LocalLockBackend`]: in-process state, for tests and single-node use
//! - [`RedisLockBackend`]: shared state in Redis, for multiple executors
//!
//! # Leases
//!
//! Every acquisition carries a lease. Once it runs out the lock no longer
//! counts as held and its semaphore slot is reclaimed by the next acquirer.
//! Long-running holders call [`TaskLock::renew`] to extend the lease.

pub mod distributed;
pub mod local;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::TaskLockError;
use crate::model::TaskKey;

pub use self::distributed::RedisLockBackend;
pub use self::local::LocalLockBackend;

/// Default lease granted to a lock holder.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Default upper bound between two acquisition attempts while waiting.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of a single, non-waiting acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The lock is now held by the requesting owner.
    Acquired,
    /// Another live holder (possibly the same owner) has the task.
    Held,
    /// The query already has `max_concurrency` live task locks.
    NoPermit { max_concurrency: u32 },
}

/// Storage strategy for semaphores and task locks.
///
/// Implementations must make `try_acquire` atomic: the semaphore check, the
/// lock check and the grant happen as one step.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Creates the semaphore, or replaces its limit if it exists.
    async fn create_semaphore(&self, query_id: Uuid, max_concurrency: u32) -> Result<(), TaskLockError>;

    /// Removes the semaphore together with every lock held under it.
    async fn delete_semaphore(&self, query_id: Uuid) -> Result<(), TaskLockError>;

    async fn semaphore_exists(&self, query_id: Uuid) -> Result<bool, TaskLockError>;

    /// Queries that currently have a semaphore.
    async fn queries(&self) -> Result<HashSet<Uuid>, TaskLockError>;

    /// Attempts to lock the task for `owner` with the given lease.
    ///
    /// Fails with `MissingSemaphore` when the task's query has no semaphore.
    async fn try_acquire(
        &self,
        key: &TaskKey,
        owner: Uuid,
        lease: Duration,
    ) -> Result<Acquire, TaskLockError>;

    /// Releases the task lock.
    ///
    /// With `Some(owner)` only a live lock held by that owner is released;
    /// with `None` any holder is evicted. Returns whether a lock was removed.
    async fn release(&self, key: &TaskKey, owner: Option<Uuid>) -> Result<bool, TaskLockError>;

    /// Extends a live lock held by `owner`. Returns false if it is not held.
    async fn renew(&self, key: &TaskKey, owner: Uuid, lease: Duration) -> Result<bool, TaskLockError>;

    /// Owner of the live lock on the task, if any.
    async fn holder(&self, key: &TaskKey) -> Result<Option<Uuid>, TaskLockError>;

    /// Free slots in the query's semaphore, `None` if it has no semaphore.
    async fn available_permits(&self, query_id: Uuid) -> Result<Option<u32>, TaskLockError>;

    /// Drops all semaphores and locks.
    async fn clear(&self) -> Result<(), TaskLockError>;

    /// Waits until a lock of the query may have been released, or `max_wait`.
    async fn wait_for_release(&self, _query_id: Uuid, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

/// Lock façade used by one executor process.
///
/// Cloning is cheap; clones share the backend and the owner id.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    owner: Uuid,
    lease: Duration,
    retry_interval: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("owner", &self.owner)
            .field("lease", &self.lease)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl LockManager {
    /// Creates a manager with a fresh owner id and default timings.
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self {
            backend,
            owner: Uuid::new_v4(),
            lease: DEFAULT_LEASE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Identity of this executor process.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// Lease granted when no explicit lease is requested.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Registers the semaphore bounding the query's concurrently locked tasks.
    ///
    /// Calling it again replaces the limit.
    pub async fn create_semaphore(
        &self,
        query_id: Uuid,
        max_concurrency: u32,
    ) -> Result<(), TaskLockError> {
        if max_concurrency == 0 {
            return Err(TaskLockError::InvalidConcurrency(max_concurrency));
        }
        self.backend.create_semaphore(query_id, max_concurrency).await?;
        debug!(query_id = %query_id, max_concurrency, "Created semaphore");
        Ok(())
    }

    /// Removes the query's semaphore, releasing every lock under it.
    pub async fn delete_semaphore(&self, query_id: Uuid) -> Result<(), TaskLockError> {
        self.backend.delete_semaphore(query_id).await?;
        debug!(query_id = %query_id, "Deleted semaphore");
        Ok(())
    }

    pub async fn semaphore_exists(&self, query_id: Uuid) -> Result<bool, TaskLockError> {
        self.backend.semaphore_exists(query_id).await
    }

    /// Queries with a live semaphore.
    pub async fn get_queries(&self) -> Result<HashSet<Uuid>, TaskLockError> {
        self.backend.queries().await
    }

    pub async fn available_permits(&self, query_id: Uuid) -> Result<Option<u32>, TaskLockError> {
        self.backend.available_permits(query_id).await
    }

    /// Returns the lock handle for a task.
    pub fn get_lock(&self, key: TaskKey) -> TaskLock {
        TaskLock {
            manager: self.clone(),
            key,
        }
    }

    /// Whether anyone currently holds a live lock on the task.
    pub async fn is_locked(&self, key: &TaskKey) -> Result<bool, TaskLockError> {
        Ok(self.backend.holder(key).await?.is_some())
    }

    /// Whether this owner currently holds a live lock on the task.
    pub async fn is_held_by_owner(&self, key: &TaskKey) -> Result<bool, TaskLockError> {
        Ok(self.backend.holder(key).await? == Some(self.owner))
    }

    /// Drops all semaphores and locks.
    pub async fn clear(&self) -> Result<(), TaskLockError> {
        self.backend.clear().await
    }

    async fn acquire(
        &self,
        key: &TaskKey,
        wait: Duration,
        lease: Duration,
    ) -> Result<(), TaskLockError> {
        let deadline = Instant::now() + wait;
        loop {
            let err = match self.backend.try_acquire(key, self.owner, lease).await? {
                Acquire::Acquired => {
                    debug!(task_key = %key, owner = %self.owner, lease_ms = lease.as_millis() as u64, "Locked task");
                    return Ok(());
                }
                Acquire::Held => TaskLockError::Contended(key.clone()),
                Acquire::NoPermit { max_concurrency } => TaskLockError::ConcurrencyLimit {
                    query_id: key.query_id(),
                    max_concurrency,
                },
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(err);
            }
            let pause = (deadline - now).min(self.retry_interval);
            self.backend.wait_for_release(key.query_id(), pause).await;
        }
    }
}

/// Lock handle scoped to one task.
///
/// Locks are not reentrant: a second `try_lock` fails with `Contended` even
/// when this owner already holds the lock.
#[derive(Debug, Clone)]
pub struct TaskLock {
    manager: LockManager,
    key: TaskKey,
}

impl TaskLock {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Single acquisition attempt with the manager's default lease.
    pub async fn try_lock(&self) -> Result<(), TaskLockError> {
        self.try_lock_for(Duration::ZERO).await
    }

    /// Retries acquisition for up to `wait`.
    pub async fn try_lock_for(&self, wait: Duration) -> Result<(), TaskLockError> {
        self.manager.acquire(&self.key, wait, self.manager.lease).await
    }

    /// Retries acquisition for up to `wait`, granting `lease` on success.
    pub async fn try_lock_with_lease(
        &self,
        wait: Duration,
        lease: Duration,
    ) -> Result<(), TaskLockError> {
        self.manager.acquire(&self.key, wait, lease).await
    }

    /// Releases a lock held by this owner.
    pub async fn unlock(&self) -> Result<(), TaskLockError> {
        if self
            .manager
            .backend
            .release(&self.key, Some(self.manager.owner))
            .await?
        {
            debug!(task_key = %self.key, "Unlocked task");
            Ok(())
        } else {
            Err(TaskLockError::NotHeld(self.key.clone()))
        }
    }

    /// Releases the lock whoever holds it. Returns whether a lock was held.
    pub async fn force_unlock(&self) -> Result<bool, TaskLockError> {
        let released = self.manager.backend.release(&self.key, None).await?;
        if released {
            debug!(task_key = %self.key, "Force unlocked task");
        }
        Ok(released)
    }

    pub async fn is_locked(&self) -> Result<bool, TaskLockError> {
        self.manager.is_locked(&self.key).await
    }

    /// Extends this owner's lease by the manager's default lease.
    pub async fn renew(&self) -> Result<(), TaskLockError> {
        self.renew_for(self.manager.lease).await
    }

    /// Extends this owner's lease to `lease` from now.
    pub async fn renew_for(&self, lease: Duration) -> Result<(), TaskLockError> {
        if self
            .manager
            .backend
            .renew(&self.key, self.manager.owner, lease)
            .await?
        {
            Ok(())
        } else {
            Err(TaskLockError::NotHeld(self.key.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryKey;

    fn managers() -> (LockManager, LockManager) {
        let backend: Arc<dyn LockBackend> = Arc::new(LocalLockBackend::new());
        (
            LockManager::new(backend.clone()).with_retry_interval(Duration::from_millis(5)),
            LockManager::new(backend).with_retry_interval(Duration::from_millis(5)),
        )
    }

    fn task_key() -> TaskKey {
        TaskKey::generate(QueryKey::generate("testPool", "EventQuery"))
    }

    #[tokio::test]
    async fn test_lock_requires_semaphore() {
        let (manager, _) = managers();
        let key = task_key();

        let err = manager.get_lock(key.clone()).try_lock().await.unwrap_err();
        assert!(matches!(err, TaskLockError::MissingSemaphore(id) if id == key.query_id()));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let (manager, _) = managers();
        let err = manager.create_semaphore(Uuid::new_v4(), 0).await.unwrap_err();
        assert!(matches!(err, TaskLockError::InvalidConcurrency(0)));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_not_reentrant() {
        let (first, second) = managers();
        let key = task_key();
        first.create_semaphore(key.query_id(), 3).await.unwrap();

        first.get_lock(key.clone()).try_lock().await.unwrap();
        assert!(first.is_locked(&key).await.unwrap());
        assert!(first.is_held_by_owner(&key).await.unwrap());
        assert!(!second.is_held_by_owner(&key).await.unwrap());

        let err = second.get_lock(key.clone()).try_lock().await.unwrap_err();
        assert!(matches!(err, TaskLockError::Contended(_)));

        // same owner, second attempt
        let err = first.get_lock(key.clone()).try_lock().await.unwrap_err();
        assert!(err.is_contention());
    }

    #[tokio::test]
    async fn test_unlock_by_non_owner_fails() {
        let (first, second) = managers();
        let key = task_key();
        first.create_semaphore(key.query_id(), 1).await.unwrap();
        first.get_lock(key.clone()).try_lock().await.unwrap();

        let err = second.get_lock(key.clone()).unlock().await.unwrap_err();
        assert!(matches!(err, TaskLockError::NotHeld(_)));
        assert!(first.is_locked(&key).await.unwrap());

        assert!(second.get_lock(key.clone()).force_unlock().await.unwrap());
        assert!(!first.is_locked(&key).await.unwrap());
        assert!(!second.get_lock(key.clone()).force_unlock().await.unwrap());
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrent_locks() {
        let (manager, _) = managers();
        let query_key = QueryKey::generate("testPool", "EventQuery");
        manager.create_semaphore(query_key.query_id, 2).await.unwrap();

        let keys: Vec<TaskKey> = (0..3).map(|_| TaskKey::generate(query_key.clone())).collect();
        manager.get_lock(keys[0].clone()).try_lock().await.unwrap();
        manager.get_lock(keys[1].clone()).try_lock().await.unwrap();
        assert_eq!(manager.available_permits(query_key.query_id).await.unwrap(), Some(0));

        let err = manager.get_lock(keys[2].clone()).try_lock().await.unwrap_err();
        assert!(matches!(
            err,
            TaskLockError::ConcurrencyLimit { max_concurrency: 2, .. }
        ));

        manager.get_lock(keys[0].clone()).unlock().await.unwrap();
        manager.get_lock(keys[2].clone()).try_lock().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiting_acquire_succeeds_after_release() {
        let (first, second) = managers();
        let key = task_key();
        first.create_semaphore(key.query_id(), 1).await.unwrap();
        first.get_lock(key.clone()).try_lock().await.unwrap();

        let releaser = first.get_lock(key.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            releaser.unlock().await.unwrap();
        });

        second
            .get_lock(key.clone())
            .try_lock_for(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(second.is_held_by_owner(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_waiting_acquire_times_out() {
        let (first, second) = managers();
        let key = task_key();
        first.create_semaphore(key.query_id(), 1).await.unwrap();
        first.get_lock(key.clone()).try_lock().await.unwrap();

        let started = std::time::Instant::now();
        let err = second
            .get_lock(key.clone())
            .try_lock_for(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_contention());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_expired_lease_frees_lock_and_slot() {
        let (first, second) = managers();
        let query_key = QueryKey::generate("testPool", "EventQuery");
        let key = TaskKey::generate(query_key.clone());
        let other = TaskKey::generate(query_key.clone());
        first.create_semaphore(query_key.query_id, 1).await.unwrap();

        first
            .get_lock(key.clone())
            .try_lock_with_lease(Duration::ZERO, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!first.is_locked(&key).await.unwrap());
        second.get_lock(other).try_lock().await.unwrap();

        let err = first.get_lock(key.clone()).renew().await.unwrap_err();
        assert!(matches!(err, TaskLockError::NotHeld(_)));
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let (manager, _) = managers();
        let key = task_key();
        manager.create_semaphore(key.query_id(), 1).await.unwrap();
        let lock = manager.get_lock(key.clone());

        lock.try_lock_with_lease(Duration::ZERO, Duration::from_millis(40))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.renew_for(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_semaphore_releases_locks() {
        let (manager, _) = managers();
        let key = task_key();
        manager.create_semaphore(key.query_id(), 1).await.unwrap();
        manager.get_lock(key.clone()).try_lock().await.unwrap();
        assert!(manager.get_queries().await.unwrap().contains(&key.query_id()));

        manager.delete_semaphore(key.query_id()).await.unwrap();
        assert!(!manager.is_locked(&key).await.unwrap());
        assert!(!manager.semaphore_exists(key.query_id()).await.unwrap());
        assert!(manager.get_queries().await.unwrap().is_empty());
    }
}
