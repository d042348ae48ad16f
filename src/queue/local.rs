//! In-process queue backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{NotificationSource, QueryTaskNotification, QueueBackend, QueueError};
use crate::model::QueryPool;

#[derive(Debug, Default)]
struct Queues {
    pools: HashMap<QueryPool, VecDeque<QueryTaskNotification>>,
    /// Discarded query ids and when the marker lapses.
    discarded: HashMap<Uuid, Instant>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<Queues>,
    pushed: Notify,
    popped: Notify,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_first(&self, pools: &[QueryPool]) -> Option<QueryTaskNotification> {
        let mut queues = self.queues();
        let popped = pools
            .iter()
            .find_map(|pool| queues.pools.get_mut(pool).and_then(VecDeque::pop_front));
        drop(queues);
        if popped.is_some() {
            self.popped.notify_waiters();
        }
        popped
    }
}

/// Pool queues kept in memory.
///
/// Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct LocalQueueBackend {
    shared: Arc<Shared>,
}

impl LocalQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for LocalQueueBackend {
    async fn ensure_queue(&self, pool: &QueryPool) -> Result<(), QueueError> {
        self.shared
            .queues()
            .pools
            .entry(pool.clone())
            .or_default();
        Ok(())
    }

    async fn delete_queue(&self, pool: &QueryPool) -> Result<(), QueueError> {
        self.shared.queues().pools.remove(pool);
        self.shared.popped.notify_waiters();
        Ok(())
    }

    async fn empty_queue(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        let dropped = self
            .shared
            .queues()
            .pools
            .get_mut(pool)
            .map(|queue| queue.drain(..).count())
            .unwrap_or(0);
        self.shared.popped.notify_waiters();
        Ok(dropped)
    }

    async fn queue_size(&self, pool: &QueryPool) -> Result<usize, QueueError> {
        Ok(self
            .shared
            .queues()
            .pools
            .get(pool)
            .map(VecDeque::len)
            .unwrap_or(0))
    }

    async fn try_push(
        &self,
        notification: &QueryTaskNotification,
        capacity: usize,
    ) -> Result<bool, QueueError> {
        {
            let mut queues = self.shared.queues();
            let queue = queues.pools.entry(notification.pool().clone()).or_default();
            if queue.len() >= capacity {
                return Ok(false);
            }
            queue.push_back(notification.clone());
        }
        self.shared.pushed.notify_waiters();
        Ok(true)
    }

    async fn requeue(&self, notification: &QueryTaskNotification) -> Result<(), QueueError> {
        self.shared
            .queues()
            .pools
            .entry(notification.pool().clone())
            .or_default()
            .push_front(notification.clone());
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn discard_query(
        &self,
        pool: &QueryPool,
        query_id: Uuid,
        ttl: Duration,
    ) -> Result<usize, QueueError> {
        let removed = {
            let mut queues = self.shared.queues();
            queues.discarded.insert(query_id, Instant::now() + ttl);
            match queues.pools.get_mut(pool) {
                Some(queue) => {
                    let before = queue.len();
                    queue.retain(|n| n.query_id() != query_id);
                    before - queue.len()
                }
                None => 0,
            }
        };
        if removed > 0 {
            self.shared.popped.notify_waiters();
        }
        Ok(removed)
    }

    async fn is_discarded(&self, query_id: Uuid) -> Result<bool, QueueError> {
        let now = Instant::now();
        let mut queues = self.shared.queues();
        queues.discarded.retain(|_, lapses_at| *lapses_at > now);
        Ok(queues.discarded.contains_key(&query_id))
    }

    async fn clear(&self) -> Result<(), QueueError> {
        {
            let mut queues = self.shared.queues();
            queues.pools.clear();
            queues.discarded.clear();
        }
        self.shared.popped.notify_waiters();
        Ok(())
    }

    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>, QueueError> {
        Ok(Box::new(LocalNotificationSource {
            shared: self.shared.clone(),
        }))
    }

    async fn wait_for_space(&self, _pool: &QueryPool, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.shared.popped.notified()).await;
    }
}

struct LocalNotificationSource {
    shared: Arc<Shared>,
}

#[async_trait]
impl NotificationSource for LocalNotificationSource {
    async fn pop(
        &mut self,
        pools: &[QueryPool],
        wait: Duration,
    ) -> Result<Option<QueryTaskNotification>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            // register interest before looking so a push in between is not missed
            let pushed = self.shared.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(notification) = self.shared.pop_first(pools) {
                return Ok(Some(notification));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueryKey, TaskKey};

    fn notification(pool: &str) -> QueryTaskNotification {
        QueryTaskNotification::new(TaskKey::generate(QueryKey::generate(pool, "EventQuery")))
    }

    #[tokio::test]
    async fn test_fifo_per_pool() {
        let backend = LocalQueueBackend::new();
        let mut source = backend.notification_source().await.unwrap();
        let pool = QueryPool::from("pool");
        let (first, second) = (notification("pool"), notification("pool"));

        assert!(backend.try_push(&first, 10).await.unwrap());
        assert!(backend.try_push(&second, 10).await.unwrap());

        let pools = [pool.clone()];
        assert_eq!(source.pop(&pools, Duration::ZERO).await.unwrap(), Some(first));
        assert_eq!(source.pop(&pools, Duration::ZERO).await.unwrap(), Some(second));
        assert_eq!(source.pop(&pools, Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head() {
        let backend = LocalQueueBackend::new();
        let mut source = backend.notification_source().await.unwrap();
        let (queued, returned) = (notification("pool"), notification("pool"));

        backend.try_push(&queued, 1).await.unwrap();
        backend.requeue(&returned).await.unwrap();
        assert_eq!(backend.queue_size(&QueryPool::from("pool")).await.unwrap(), 2);

        let pools = [QueryPool::from("pool")];
        assert_eq!(source.pop(&pools, Duration::ZERO).await.unwrap(), Some(returned));
    }

    #[tokio::test]
    async fn test_pop_prefers_pool_order() {
        let backend = LocalQueueBackend::new();
        let mut source = backend.notification_source().await.unwrap();
        let (a, b) = (notification("a"), notification("b"));
        backend.try_push(&a, 10).await.unwrap();
        backend.try_push(&b, 10).await.unwrap();

        let order = [QueryPool::from("b"), QueryPool::from("a")];
        assert_eq!(source.pop(&order, Duration::ZERO).await.unwrap(), Some(b));
        assert_eq!(source.pop(&order, Duration::ZERO).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let backend = LocalQueueBackend::new();
        let mut source = backend.notification_source().await.unwrap();
        let sent = notification("pool");

        let pusher = {
            let backend = backend.clone();
            let sent = sent.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                backend.try_push(&sent, 10).await.unwrap();
            })
        };

        let pools = [QueryPool::from("pool")];
        let popped = source.pop(&pools, Duration::from_secs(5)).await.unwrap();
        assert_eq!(popped, Some(sent));
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_marker_lapses() {
        let backend = LocalQueueBackend::new();
        let query_id = Uuid::new_v4();
        backend
            .discard_query(&QueryPool::from("pool"), query_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(backend.is_discarded(query_id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!backend.is_discarded(query_id).await.unwrap());
    }
}
