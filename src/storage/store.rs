//! Persistence strategy for tasks, checkpoints and query records.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationError;
use crate::model::{
    QueryCheckpoint, QueryLifecycle, QueryPool, QueryStatus, QueryTask, TaskKey, TaskState,
    TaskStates,
};

/// Errors that can occur in a task store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored record could not be turned back into a value.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Persisted state of queries and their tasks.
///
/// Every method is atomic on its own: readers never observe half of a write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores a new query: its status, its task states and its first task.
    async fn create_query(
        &self,
        status: &QueryStatus,
        task_states: &TaskStates,
        task: &QueryTask,
    ) -> Result<(), StoreError>;

    /// Stores a task and marks it `Ready` in its query's task states.
    ///
    /// Returns false, storing nothing, if the query has no task states
    /// (it was never stored or has been deleted).
    async fn create_task(&self, task: &QueryTask) -> Result<bool, StoreError>;

    async fn get_task(&self, key: &TaskKey) -> Result<Option<QueryTask>, StoreError>;

    /// Replaces a task's checkpoint. Returns false if the task is gone.
    async fn update_checkpoint(
        &self,
        key: &TaskKey,
        checkpoint: &QueryCheckpoint,
    ) -> Result<bool, StoreError>;

    /// Removes a task and its state entry. Returns false if it was absent.
    async fn delete_task(&self, key: &TaskKey) -> Result<bool, StoreError>;

    /// Tasks of a query, oldest first.
    async fn get_tasks(&self, query_id: Uuid) -> Result<Vec<QueryTask>, StoreError>;

    /// Tasks of every query in a pool.
    async fn get_pool_tasks(&self, pool: &QueryPool) -> Result<Vec<QueryTask>, StoreError>;

    /// Removes the query's tasks, task states and status together.
    ///
    /// Returns false if nothing was stored for the query.
    async fn delete_query(&self, query_id: Uuid) -> Result<bool, StoreError>;

    async fn get_query_status(&self, query_id: Uuid) -> Result<Option<QueryStatus>, StoreError>;

    async fn get_query_statuses(&self) -> Result<Vec<QueryStatus>, StoreError>;

    /// Inserts or replaces a status record.
    async fn put_query_status(&self, status: &QueryStatus) -> Result<(), StoreError>;

    /// Moves an existing status to `lifecycle`, returning the updated record.
    async fn update_query_lifecycle(
        &self,
        query_id: Uuid,
        lifecycle: QueryLifecycle,
    ) -> Result<Option<QueryStatus>, StoreError>;

    async fn get_task_states(&self, query_id: Uuid) -> Result<Option<TaskStates>, StoreError>;

    /// Applies `TaskStates::set_state` to the task's query.
    ///
    /// `None` if the query has no task states or the task is not registered
    /// in them, otherwise whether the transition was accepted.
    async fn update_task_state(
        &self,
        key: &TaskKey,
        state: TaskState,
    ) -> Result<Option<bool>, StoreError>;

    /// Removes everything.
    async fn clear(&self) -> Result<(), StoreError>;
}
