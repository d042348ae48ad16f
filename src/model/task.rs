//! Tasks, task actions and per-query task state tracking.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::checkpoint::{CheckpointError, QueryCheckpoint};
use super::keys::{QueryKey, TaskKey};

/// What an executor is asked to do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryAction {
    /// Set up a new query from its original parameters.
    Create,
    /// Plan a query without running it.
    Define,
    /// Produce the next page of results.
    Next,
    /// Tear down a query.
    Close,
}

impl QueryAction {
    /// All actions, in declaration order.
    pub const ALL: [QueryAction; 4] = [
        QueryAction::Create,
        QueryAction::Define,
        QueryAction::Next,
        QueryAction::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryAction::Create => "CREATE",
            QueryAction::Define => "DEFINE",
            QueryAction::Next => "NEXT",
            QueryAction::Close => "CLOSE",
        }
    }
}

impl fmt::Display for QueryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueryAction::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown query action '{}'", s))
    }
}

/// The unit of work delivered to an executor.
///
/// The checkpoint always belongs to the same query as the task key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTask {
    task_key: TaskKey,
    action: QueryAction,
    checkpoint: QueryCheckpoint,
}

impl QueryTask {
    /// Creates a task with a new task id for the checkpoint's query.
    pub fn new(action: QueryAction, checkpoint: QueryCheckpoint) -> Self {
        Self {
            task_key: TaskKey::generate(checkpoint.query_key.clone()),
            action,
            checkpoint,
        }
    }

    /// Reassembles a stored task, checking the key and checkpoint agree.
    pub fn from_parts(
        task_key: TaskKey,
        action: QueryAction,
        checkpoint: QueryCheckpoint,
    ) -> Result<Self, CheckpointError> {
        ensure_same_query(&task_key, &checkpoint)?;
        Ok(Self {
            task_key,
            action,
            checkpoint,
        })
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    pub fn action(&self) -> QueryAction {
        self.action
    }

    pub fn checkpoint(&self) -> &QueryCheckpoint {
        &self.checkpoint
    }

    /// Replaces the checkpoint; identity and action stay the same.
    pub fn replace_checkpoint(&mut self, checkpoint: QueryCheckpoint) -> Result<(), CheckpointError> {
        ensure_same_query(&self.task_key, &checkpoint)?;
        self.checkpoint = checkpoint;
        Ok(())
    }
}

/// Checks that a checkpoint belongs to the query identified by a task key.
pub fn ensure_same_query(
    task_key: &TaskKey,
    checkpoint: &QueryCheckpoint,
) -> Result<(), CheckpointError> {
    if checkpoint.query_key != task_key.query_key {
        return Err(CheckpointError::Invalid(format!(
            "checkpoint query key {} does not match {}",
            checkpoint.query_key, task_key
        )));
    }
    Ok(())
}

/// Coarse progress of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// States of all tasks of one query, with a cap on running tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStates {
    pub query_key: QueryKey,
    pub max_running: u32,
    #[serde(default)]
    pub states: BTreeMap<Uuid, TaskState>,
}

impl TaskStates {
    pub fn new(query_key: QueryKey, max_running: u32) -> Self {
        Self {
            query_key,
            max_running,
            states: BTreeMap::new(),
        }
    }

    pub fn state(&self, task_id: &Uuid) -> Option<TaskState> {
        self.states.get(task_id).copied()
    }

    /// Registers a newly stored task as `Ready`.
    pub fn add_task(&mut self, task_id: Uuid) {
        self.states.insert(task_id, TaskState::Ready);
    }

    /// Records a new state for a registered task.
    ///
    /// `None` if the task was never registered. A transition into `Running`
    /// is refused (`Some(false)`) when `max_running` other tasks are already
    /// running.
    pub fn set_state(&mut self, task_id: Uuid, state: TaskState) -> Option<bool> {
        let current = self.state(&task_id)?;
        if state == TaskState::Running
            && current != TaskState::Running
            && self.count(TaskState::Running) >= self.max_running as usize
        {
            return Some(false);
        }
        self.states.insert(task_id, state);
        Some(true)
    }

    pub fn remove(&mut self, task_id: &Uuid) -> Option<TaskState> {
        self.states.remove(task_id)
    }

    /// Number of tasks in the given state.
    pub fn count(&self, state: TaskState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    /// Tasks that have not yet completed or failed.
    pub fn unfinished(&self) -> usize {
        self.count(TaskState::Ready) + self.count(TaskState::Running)
    }
}

/// Read-only projection of a task for listing and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub task_key: TaskKey,
    pub action: QueryAction,
    pub parameters: BTreeMap<String, String>,
}

impl From<&QueryTask> for TaskDescription {
    fn from(task: &QueryTask) -> Self {
        Self {
            task_key: task.task_key().clone(),
            action: task.action(),
            parameters: task.checkpoint().string_properties(),
        }
    }
}
