//! Persistent storage of queries, tasks and checkpoints.
//!
//! # Overview
//!
//! The storage layer consists of:
//! - **TaskStore**: the persistence strategy, with an in-memory
//!   implementation ([`MemoryTaskStore`]) and a PostgreSQL one ([`PgTaskStore`])
//! - **Migrations**: schema management for the PostgreSQL store
//! - **QueryStorageService**: the façade that stores queries, hands out
//!   locked tasks and sends notifications
//!
//! # Usage
//!
//! ```rust,ignore
//! use query_storage::config::StorageConfig;
//! use query_storage::model::{QueryAction, QueryPool};
//! use query_storage::storage::QueryStorageService;
//!
//! let service = QueryStorageService::connect(&StorageConfig::from_env()?).await?;
//! let pool = QueryPool::from("default");
//!
//! // Submit a query
//! let task_key = service.store_query(&pool, params, 3).await?;
//!
//! // Executor side
//! let mut listener = service.create_listener("executor-1", &[pool]).await?;
//! if let Some(notification) = listener.receive().await? {
//!     if let Some(task) = service.get_task(&notification.task_key, Duration::ZERO).await? {
//!         // ... run the task, then checkpoint or delete it
//!         service.delete_task(task.task_key()).await?;
//!     }
//! }
//! ```

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;
pub mod service;
pub mod store;

pub use database::PgTaskStore;
pub use memory::MemoryTaskStore;
pub use migrations::{MigrationError, MigrationRunner};
pub use service::QueryStorageService;
pub use store::{StoreError, TaskStore};
