//! Error types for query storage operations.
//!
//! Three classes of failure are kept apart:
//! - Contention (another owner holds the lock, or the query is at its
//!   concurrency limit): recoverable, back off and retry or abandon
//! - Protocol violations (no semaphore for the query, checkpointing without
//!   the lock, mismatched keys): programming errors, never retried
//! - Absence (task or query already deleted): not an error at all, reads
//!   return `None` or an empty list

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::model::{CheckpointError, TaskKey};
use crate::queue::QueueError;
use crate::storage::StoreError;

/// Errors raised by the lock manager.
#[derive(Debug, Error)]
pub enum TaskLockError {
    #[error("Task {0} is locked by another owner")]
    Contended(TaskKey),

    #[error("Query {query_id} already has {max_concurrency} locked tasks")]
    ConcurrencyLimit { query_id: Uuid, max_concurrency: u32 },

    #[error("No semaphore registered for query {0}")]
    MissingSemaphore(Uuid),

    #[error("Lock for task {0} is not held by this owner")]
    NotHeld(TaskKey),

    #[error("Invalid max concurrency {0}: must be greater than 0")]
    InvalidConcurrency(u32),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl TaskLockError {
    /// Whether the failure is ordinary contention the caller may retry.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            TaskLockError::Contended(_) | TaskLockError::ConcurrencyLimit { .. }
        )
    }

    /// Whether the failure is a protocol or programming error.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TaskLockError::MissingSemaphore(_)
                | TaskLockError::NotHeld(_)
                | TaskLockError::InvalidConcurrency(_)
        )
    }
}

/// Errors raised by the storage service.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Lock(#[from] TaskLockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task {0} not found")]
    TaskNotFound(TaskKey),

    #[error("Query {0} not found")]
    QueryNotFound(Uuid),

    /// The task is stored but no notification went out for it.
    ///
    /// The task stays fetchable under `task_key`; executors polling storage
    /// still find it.
    #[error("Task {task_key} stored but not announced: {source}")]
    NotificationFailed {
        task_key: TaskKey,
        #[source]
        source: QueueError,
    },
}

impl From<CheckpointError> for StorageError {
    fn from(err: CheckpointError) -> Self {
        StorageError::InvalidArgument(err.to_string())
    }
}

impl StorageError {
    /// Whether the failure is lock contention the caller may retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, StorageError::Lock(e) if e.is_contention())
    }

    /// Whether the failure is a protocol or programming error.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            StorageError::Lock(e) => e.is_protocol_violation(),
            StorageError::InvalidArgument(_) => true,
            _ => false,
        }
    }

    /// Key of a task that was stored even though the call failed.
    pub fn stored_task(&self) -> Option<&TaskKey> {
        match self {
            StorageError::NotificationFailed { task_key, .. } => Some(task_key),
            _ => None,
        }
    }

    /// Whether the failure reports a task or query that no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::TaskNotFound(_) | StorageError::QueryNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryKey;

    #[test]
    fn test_lock_error_classification() {
        let key = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));

        assert!(TaskLockError::Contended(key.clone()).is_contention());
        assert!(TaskLockError::ConcurrencyLimit {
            query_id: key.query_id(),
            max_concurrency: 3
        }
        .is_contention());
        assert!(!TaskLockError::MissingSemaphore(key.query_id()).is_contention());

        assert!(TaskLockError::MissingSemaphore(key.query_id()).is_protocol_violation());
        assert!(TaskLockError::NotHeld(key.clone()).is_protocol_violation());
        assert!(TaskLockError::InvalidConcurrency(0).is_protocol_violation());
        assert!(!TaskLockError::Backend("down".to_string()).is_protocol_violation());
    }

    #[test]
    fn test_storage_error_classification() {
        let key = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));

        let err = StorageError::from(TaskLockError::Contended(key.clone()));
        assert!(err.is_contention());
        assert!(!err.is_protocol_violation());
        assert!(err.to_string().contains("locked by another owner"));

        let err = StorageError::from(TaskLockError::MissingSemaphore(key.query_id()));
        assert!(err.is_protocol_violation());
        assert!(err.to_string().contains(&key.query_id().to_string()));

        let err = StorageError::TaskNotFound(key.clone());
        assert!(err.is_not_found());
        assert!(!err.is_contention());

        let err = StorageError::from(CheckpointError::MissingProperty("query"));
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(err.is_protocol_violation());
        assert_eq!(err.stored_task(), None);
    }

    #[test]
    fn test_notification_failure_carries_stored_task() {
        let key = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));
        let err = StorageError::NotificationFailed {
            task_key: key.clone(),
            source: QueueError::QueueFull {
                pool: key.query_pool().clone(),
                capacity: 10,
            },
        };

        assert_eq!(err.stored_task(), Some(&key));
        assert!(!err.is_not_found());
        assert!(err.to_string().contains(&key.to_string()));
        assert!(std::error::Error::source(&err).is_some());
    }
}
