//! Schema migrations for the PostgreSQL task store.
//!
//! All pending migrations run in one transaction that first takes a
//! transaction-scoped advisory lock, so executors starting together against
//! an empty database apply the schema exactly once. Applied names are kept in
//! `_query_storage_migrations`.

use std::collections::HashSet;

use sqlx::{Executor, PgPool};
use thiserror::Error;
use tracing::info;

use super::schema::MIGRATIONS;

/// Advisory lock key taken while migrations run.
const MIGRATION_LOCK_ID: i64 = 0x7173_6d69_6772;

const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _query_storage_migrations (
    name VARCHAR(255) PRIMARY KEY,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {name} failed: {source}")]
    Failed {
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Applies the task store schema.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration not yet recorded.
    ///
    /// Returns the names applied by this call; empty when the schema was
    /// already current.
    pub async fn run_migrations(&self) -> Result<Vec<&'static str>, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_ID)
            .execute(&mut *tx)
            .await?;
        (&mut *tx).execute(CREATE_MIGRATIONS_TABLE).await?;

        let done: HashSet<String> =
            sqlx::query_scalar::<_, String>("SELECT name FROM _query_storage_migrations")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let mut applied = Vec::new();
        for &(name, sql) in MIGRATIONS.iter().filter(|(name, _)| !done.contains(*name)) {
            // a bare &str runs over the simple query protocol, which accepts several statements
            (&mut *tx)
                .execute(sql)
                .await
                .map_err(|source| MigrationError::Failed { name, source })?;
            sqlx::query("INSERT INTO _query_storage_migrations (name) VALUES ($1)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            applied.push(name);
        }
        tx.commit().await?;

        if !applied.is_empty() {
            info!(migrations = ?applied, "Applied task store migrations");
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_names_the_migration() {
        let err = MigrationError::Failed {
            name: "0003_query_tasks",
            source: sqlx::Error::Protocol("syntax".to_string()),
        };
        assert!(err.to_string().contains("0003_query_tasks"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL server"]
    async fn test_migrations_are_idempotent() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/query_storage".to_string());
        let runner = MigrationRunner::new(PgPool::connect(&url).await.unwrap());

        runner.run_migrations().await.unwrap();
        assert!(runner.run_migrations().await.unwrap().is_empty());
    }
}
