//! Database schema constants for the PostgreSQL task store.

/// One row per query: the serialized `QueryStatus` plus searchable columns.
pub const CREATE_QUERY_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_status (
    query_id UUID PRIMARY KEY,
    query_pool VARCHAR(255) NOT NULL,
    query_logic VARCHAR(255) NOT NULL,
    lifecycle VARCHAR(32) NOT NULL,
    status JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// One row per query: the serialized `TaskStates`.
pub const CREATE_QUERY_TASK_STATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_task_states (
    query_id UUID PRIMARY KEY,
    task_states JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// One row per task; the checkpoint is the serialized `QueryCheckpoint`.
pub const CREATE_QUERY_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_tasks (
    task_id UUID PRIMARY KEY,
    query_id UUID NOT NULL,
    query_pool VARCHAR(255) NOT NULL,
    query_logic VARCHAR(255) NOT NULL,
    action VARCHAR(16) NOT NULL,
    checkpoint JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_query_tasks_query_id ON query_tasks(query_id);
CREATE INDEX IF NOT EXISTS idx_query_tasks_query_pool ON query_tasks(query_pool);
CREATE INDEX IF NOT EXISTS idx_query_status_lifecycle ON query_status(lifecycle)
"#;

/// Schema migrations by name, in the order they must run.
///
/// Names are recorded once applied; never rename or reorder an entry.
pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_query_status", CREATE_QUERY_STATUS_TABLE),
    ("0002_query_task_states", CREATE_QUERY_TASK_STATES_TABLE),
    ("0003_query_tasks", CREATE_QUERY_TASKS_TABLE),
    ("0004_indexes", CREATE_INDEXES),
];

/// Table names in the schema.
pub mod tables {
    pub const QUERY_STATUS: &str = "query_status";
    pub const QUERY_TASK_STATES: &str = "query_task_states";
    pub const QUERY_TASKS: &str = "query_tasks";
}
