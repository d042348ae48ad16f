//! Value types shared by the lock manager, the queue manager and storage.
//!
//! These carry no behavior beyond validation and equality:
//!
//! - `QueryPool`, `QueryKey`, `TaskKey`: identity
//! - `QueryParameters`, `QueryCheckpoint`: resumable query state
//! - `QueryTask`, `QueryAction`: the unit handed to executors
//! - `TaskStates`, `QueryStatus`, `QueryState`, `TaskDescription`: bookkeeping and projections

pub mod checkpoint;
pub mod keys;
pub mod status;
pub mod task;

pub use checkpoint::{CheckpointError, QueryCheckpoint, QueryParameters};
pub use keys::{QueryKey, QueryPool, TaskKey};
pub use status::{QueryLifecycle, QueryState, QueryStatus};
pub use task::{ensure_same_query, QueryAction, QueryTask, TaskDescription, TaskState, TaskStates};
