//! query-storage: checkpointed query tasks shared by independent executors.
//!
//! A long-running query is split into persisted tasks, each carrying a
//! checkpoint of the query's resumable state. Executors learn about ready
//! tasks from pool notification queues and claim them through per-task
//! leased locks, while a per-query semaphore bounds how many tasks of one
//! query run at the same time.

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod storage;

// Re-export the types most callers need
pub use config::{BackendKind, ConfigError, StorageConfig};
pub use error::{StorageError, TaskLockError};
pub use lock::{LockManager, TaskLock};
pub use model::{
    QueryAction, QueryCheckpoint, QueryKey, QueryLifecycle, QueryParameters, QueryPool,
    QueryState, QueryStatus, QueryTask, TaskDescription, TaskKey, TaskState, TaskStates,
};
pub use queue::{Listener, QueryTaskNotification, QueueError, QueueFullPolicy, QueueManager};
pub use storage::{QueryStorageService, StoreError};
