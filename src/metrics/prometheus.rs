//! Prometheus counters for storage service operations.
//!
//! Every [`StorageMetrics`] owns its own `Registry`, so several services in
//! one process (or one test binary) never collide on metric names.

use prometheus::{Counter, CounterVec, Encoder, Opts, Registry, TextEncoder};

use crate::model::QueryAction;

/// Counters recorded by one `QueryStorageService`.
#[derive(Clone)]
pub struct StorageMetrics {
    registry: Registry,
    tasks_created: CounterVec,
    notifications_sent: Counter,
    checkpoints: Counter,
    tasks_deleted: Counter,
    queries_deleted: Counter,
    lock_contention: Counter,
    tasks_fetched: Counter,
}

impl StorageMetrics {
    /// Creates the counters and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric cannot be created or
    /// registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_created = CounterVec::new(
            Opts::new("query_storage_tasks_created_total", "Total tasks created"),
            &["action"],
        )?;
        let notifications_sent = Counter::new(
            "query_storage_notifications_sent_total",
            "Total task notifications sent",
        )?;
        let checkpoints = Counter::new(
            "query_storage_checkpoints_total",
            "Total checkpoints written",
        )?;
        let tasks_deleted = Counter::new("query_storage_tasks_deleted_total", "Total tasks deleted")?;
        let queries_deleted = Counter::new(
            "query_storage_queries_deleted_total",
            "Total queries deleted",
        )?;
        let lock_contention = Counter::new(
            "query_storage_lock_contention_total",
            "Task fetches refused because the lock was held or the query was at its limit",
        )?;
        let tasks_fetched = Counter::new(
            "query_storage_tasks_fetched_total",
            "Total tasks fetched under a lock",
        )?;

        registry.register(Box::new(tasks_created.clone()))?;
        registry.register(Box::new(notifications_sent.clone()))?;
        registry.register(Box::new(checkpoints.clone()))?;
        registry.register(Box::new(tasks_deleted.clone()))?;
        registry.register(Box::new(queries_deleted.clone()))?;
        registry.register(Box::new(lock_contention.clone()))?;
        registry.register(Box::new(tasks_fetched.clone()))?;

        Ok(Self {
            registry,
            tasks_created,
            notifications_sent,
            checkpoints,
            tasks_deleted,
            queries_deleted,
            lock_contention,
            tasks_fetched,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_task_created(&self, action: QueryAction) {
        self.tasks_created.with_label_values(&[action.as_str()]).inc();
    }

    pub fn record_notification_sent(&self) {
        self.notifications_sent.inc();
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.inc();
    }

    pub fn record_task_deleted(&self) {
        self.tasks_deleted.inc();
    }

    pub fn record_query_deleted(&self) {
        self.queries_deleted.inc();
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention.inc();
    }

    pub fn record_task_fetched(&self) {
        self.tasks_fetched.inc();
    }

    pub fn tasks_created(&self, action: QueryAction) -> u64 {
        self.tasks_created.with_label_values(&[action.as_str()]).get() as u64
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.get() as u64
    }

    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.get() as u64
    }

    pub fn lock_contention(&self) -> u64 {
        self.lock_contention.get() as u64
    }

    pub fn tasks_fetched(&self) -> u64 {
        self.tasks_fetched.get() as u64
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

impl std::fmt::Debug for StorageMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMetrics")
            .field("notifications_sent", &self.notifications_sent())
            .field("checkpoints", &self.checkpoints())
            .field("tasks_fetched", &self.tasks_fetched())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_independent() {
        let first = StorageMetrics::new().unwrap();
        let second = StorageMetrics::new().unwrap();

        first.record_task_created(QueryAction::Create);
        first.record_notification_sent();

        assert_eq!(first.tasks_created(QueryAction::Create), 1);
        assert_eq!(second.tasks_created(QueryAction::Create), 0);
        assert_eq!(second.notifications_sent(), 0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = StorageMetrics::new().unwrap();
        metrics.record_task_created(QueryAction::Next);
        metrics.record_lock_contention();

        let text = metrics.gather_text();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("query_storage_tasks_created_total{action=\"NEXT\"} 1"));
        assert!(text.contains("query_storage_lock_contention_total 1"));
    }
}
