//! Query status records, independent of individual task churn.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::QueryParameters;
use super::keys::QueryKey;
use super::task::TaskStates;

/// Lifecycle of a query as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryLifecycle {
    Created,
    Running,
    Closed,
    Canceled,
    Failed,
}

impl QueryLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLifecycle::Created => "CREATED",
            QueryLifecycle::Running => "RUNNING",
            QueryLifecycle::Closed => "CLOSED",
            QueryLifecycle::Canceled => "CANCELED",
            QueryLifecycle::Failed => "FAILED",
        }
    }

    /// Whether no further work is expected for the query.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryLifecycle::Closed | QueryLifecycle::Canceled | QueryLifecycle::Failed
        )
    }
}

impl fmt::Display for QueryLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryLifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(QueryLifecycle::Created),
            "RUNNING" => Ok(QueryLifecycle::Running),
            "CLOSED" => Ok(QueryLifecycle::Closed),
            "CANCELED" => Ok(QueryLifecycle::Canceled),
            "FAILED" => Ok(QueryLifecycle::Failed),
            other => Err(format!("unknown query lifecycle '{}'", other)),
        }
    }
}

/// Overall status of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStatus {
    pub query_key: QueryKey,
    pub lifecycle: QueryLifecycle,
    /// The parameters the query was submitted with, when known.
    #[serde(default)]
    pub query: Option<QueryParameters>,
    #[serde(default)]
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl QueryStatus {
    /// A freshly created status with no parameters attached.
    pub fn new(query_key: QueryKey) -> Self {
        let now = Utc::now();
        Self {
            query_key,
            lifecycle: QueryLifecycle::Created,
            query: None,
            failure_message: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Attaches the submitted parameters.
    pub fn with_query(mut self, query: QueryParameters) -> Self {
        self.query = Some(query);
        self
    }

    /// Moves the query to a new lifecycle state.
    pub fn transition(&mut self, lifecycle: QueryLifecycle) {
        self.lifecycle = lifecycle;
        self.last_updated = Utc::now();
    }

    /// Marks the query failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.failure_message = Some(message.into());
        self.transition(QueryLifecycle::Failed);
    }
}

/// Aggregated view of a query for listing: status plus task states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    pub query_key: QueryKey,
    pub status: QueryStatus,
    #[serde(default)]
    pub task_states: Option<TaskStates>,
}

impl QueryState {
    pub fn new(status: QueryStatus, task_states: Option<TaskStates>) -> Self {
        Self {
            query_key: status.query_key.clone(),
            status,
            task_states,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_parse() {
        for lifecycle in [
            QueryLifecycle::Created,
            QueryLifecycle::Running,
            QueryLifecycle::Closed,
            QueryLifecycle::Canceled,
            QueryLifecycle::Failed,
        ] {
            assert_eq!(lifecycle.as_str().parse::<QueryLifecycle>().unwrap(), lifecycle);
        }
        assert!("paused".parse::<QueryLifecycle>().is_err());
        assert!(QueryLifecycle::Canceled.is_terminal());
        assert!(!QueryLifecycle::Running.is_terminal());
    }

    #[test]
    fn test_status_transitions() {
        let mut status = QueryStatus::new(QueryKey::generate("pool", "EventQuery"));
        assert_eq!(status.lifecycle, QueryLifecycle::Created);

        status.transition(QueryLifecycle::Running);
        assert_eq!(status.lifecycle, QueryLifecycle::Running);
        assert!(status.last_updated >= status.created_at);

        status.fail("scan failed");
        assert_eq!(status.lifecycle, QueryLifecycle::Failed);
        assert_eq!(status.failure_message.as_deref(), Some("scan failed"));
    }

    #[test]
    fn test_query_state_uses_status_key() {
        let status = QueryStatus::new(QueryKey::generate("pool", "EventQuery"));
        let state = QueryState::new(status.clone(), None);
        assert_eq!(state.query_key, status.query_key);
    }
}
