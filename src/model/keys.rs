//! Identity types for pools, queries and tasks.
//!
//! - `QueryPool`: a named lane of work with its own notification queue
//! - `QueryKey`: one logical running query
//! - `TaskKey`: one unit of work belonging to exactly one query

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named lane of work. Equality is by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryPool(String);

impl QueryPool {
    /// Creates a pool with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Returns whether the pool name is usable (non-blank).
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for QueryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryPool {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for QueryPool {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identifies one logical running query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryKey {
    /// Unique identifier of the query.
    pub query_id: Uuid,
    /// Pool the query runs in.
    pub query_pool: QueryPool,
    /// Name of the query logic that interprets the query.
    pub query_logic: String,
}

impl QueryKey {
    /// Creates a query key.
    pub fn new(query_id: Uuid, query_pool: impl Into<QueryPool>, query_logic: impl Into<String>) -> Self {
        Self {
            query_id,
            query_pool: query_pool.into(),
            query_logic: query_logic.into(),
        }
    }

    /// Creates a query key with a freshly generated query id.
    pub fn generate(query_pool: impl Into<QueryPool>, query_logic: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), query_pool, query_logic)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pool:{}/query:{}/logic:{}",
            self.query_pool, self.query_id, self.query_logic
        )
    }
}

/// Identifies one unit of work. Immutable once created.
///
/// Serialises flat as `{taskId, queryId, queryPool, queryLogic}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    /// Unique identifier of the task.
    pub task_id: Uuid,
    /// The query this task belongs to.
    #[serde(flatten)]
    pub query_key: QueryKey,
}

impl TaskKey {
    /// Creates a task key.
    pub fn new(task_id: Uuid, query_key: QueryKey) -> Self {
        Self { task_id, query_key }
    }

    /// Creates a task key with a freshly generated task id.
    pub fn generate(query_key: QueryKey) -> Self {
        Self::new(Uuid::new_v4(), query_key)
    }

    pub fn query_id(&self) -> Uuid {
        self.query_key.query_id
    }

    pub fn query_pool(&self) -> &QueryPool {
        &self.query_key.query_pool
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}/{}", self.task_id, self.query_key)
    }
}
