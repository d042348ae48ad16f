//! Integration tests against Redis and PostgreSQL.
//!
//! Run with:
//! QUERY_STORAGE_REDIS_URL=redis://localhost:6379 DATABASE_URL=postgres://localhost/query_storage \
//!     cargo test --test distributed_backends -- --ignored

use std::time::Duration;

use chrono::{TimeZone, Utc};
use query_storage::{
    BackendKind, QueryAction, QueryCheckpoint, QueryParameters, QueryPool, QueryStorageService,
    StorageConfig, StorageError, TaskLockError,
};
use uuid::Uuid;

fn distributed_config() -> StorageConfig {
    let redis_url = std::env::var("QUERY_STORAGE_REDIS_URL")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/query_storage".to_string());

    StorageConfig::default()
        .with_backend(BackendKind::Distributed)
        .with_redis_url(redis_url)
        .with_database_url(database_url)
        .with_key_prefix(format!("query-storage-test-{}", Uuid::new_v4()))
        .with_listener_poll_interval(Duration::from_millis(50))
        .with_max_connections(2)
}

fn params() -> QueryParameters {
    QueryParameters::new(
        "foo==bar",
        "EventQuery",
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
    )
}

#[tokio::test]
#[ignore = "requires Redis and PostgreSQL"]
async fn test_distributed_query_round_trip() {
    let config = distributed_config();
    let client = QueryStorageService::connect(&config).await.unwrap();
    let executor = QueryStorageService::connect(&config).await.unwrap();
    let pool = QueryPool::from(format!("pool-{}", Uuid::new_v4()));

    let mut listener = executor
        .create_listener("executor", &[pool.clone()])
        .await
        .unwrap();
    let key = client.store_query(&pool, params(), 3).await.unwrap();

    let notification = listener
        .receive_for(Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.task_key, key);
    assert!(listener.receive_for(Duration::ZERO).await.unwrap().is_none());

    let task = executor.get_task(&key, Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(task.checkpoint().to_parameters().unwrap(), params());

    // a second process cannot take the task
    let err = client.get_task(&key, Duration::ZERO).await.unwrap_err();
    assert!(err.is_contention());

    let checkpoint = task.checkpoint().clone().with_property("page", 1);
    executor.checkpoint_task(&key, checkpoint.clone()).await.unwrap();
    executor
        .create_task(QueryAction::Next, checkpoint)
        .await
        .unwrap();
    assert!(executor.delete_task(&key).await.unwrap());

    assert!(client.delete_query(key.query_id()).await.unwrap());
    assert!(client.get_tasks(key.query_id()).await.unwrap().is_empty());
    assert!(listener
        .receive_for(Duration::from_millis(500))
        .await
        .unwrap()
        .is_none());

    listener.stop().await.unwrap();
    client.queues().delete_queue(&pool).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis and PostgreSQL"]
async fn test_distributed_missing_semaphore() {
    let service = QueryStorageService::connect(&distributed_config())
        .await
        .unwrap();
    let query_key = query_storage::QueryKey::generate("testPool", "EventQuery");

    let err = service
        .create_task(QueryAction::Next, QueryCheckpoint::empty(query_key))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Lock(TaskLockError::MissingSemaphore(_))
    ));
}
