//! Listener: a consumer handle multiplexing one or more pool queues.
//!
//! Each listener spawns one polling task. The task walks the subscribed pools
//! round-robin, moves any notification it finds into a bounded local buffer,
//! and stops when the listener is stopped or dropped.
//!
//! # Delivery
//!
//! - Notifications of discarded queries are dropped both by the polling task
//!   and again when handed out by `receive`
//! - `stop` puts buffered, undelivered notifications back on their queues
//! - Dropping a listener without `stop` loses its buffered notifications;
//!   they are advisory and the stored tasks remain fetchable

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    ListenerRegistry, NotificationSource, QueryTaskNotification, QueueBackend, QueueError,
    QueueSettings, Subscription,
};
use crate::model::QueryPool;

/// Counters of one listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Notifications moved from pool queues into the local buffer.
    pub polled: u64,
    /// Notifications handed out by `receive`.
    pub delivered: u64,
    /// Notifications dropped because their query was discarded.
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct SharedListenerStats {
    polled: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

impl SharedListenerStats {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            polled: self.polled.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
        }
    }
}

/// Consumer handle bound to a set of pools.
pub struct Listener {
    id: String,
    subscription: Arc<Subscription>,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<ListenerRegistry>,
    buffer: mpsc::Receiver<QueryTaskNotification>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SharedListenerStats>,
    receive_wait: Duration,
    is_running: AtomicBool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("pools", &self.pools())
            .field("is_running", &self.is_running())
            .finish()
    }
}

impl Listener {
    pub(crate) fn start(
        id: String,
        subscription: Arc<Subscription>,
        source: Box<dyn NotificationSource>,
        backend: Arc<dyn QueueBackend>,
        registry: Arc<ListenerRegistry>,
        settings: &QueueSettings,
    ) -> Self {
        let (buffer_tx, buffer) = mpsc::channel(settings.listener_buffer.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedListenerStats::default());

        let poller = Poller {
            listener_id: id.clone(),
            subscription: subscription.clone(),
            source,
            backend: backend.clone(),
            buffer: buffer_tx,
            shutdown_rx: shutdown_tx.subscribe(),
            poll_interval: settings.poll_interval,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(poller.run());

        Self {
            id,
            subscription,
            backend,
            registry,
            buffer,
            shutdown_tx,
            handle: Some(handle),
            stats,
            receive_wait: settings.receive_wait,
            is_running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pools this listener currently polls.
    pub fn pools(&self) -> Vec<QueryPool> {
        self.subscription.pools()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.snapshot()
    }

    /// Waits up to the default receive wait for the next notification.
    pub async fn receive(&mut self) -> Result<Option<QueryTaskNotification>, QueueError> {
        self.receive_for(self.receive_wait).await
    }

    /// Waits up to `wait` for the next notification.
    ///
    /// `Duration::ZERO` never waits, so `Ok(None)` then means nothing is
    /// buffered right now.
    pub async fn receive_for(
        &mut self,
        wait: Duration,
    ) -> Result<Option<QueryTaskNotification>, QueueError> {
        if !self.is_running() {
            return Err(QueueError::ListenerStopped(self.id.clone()));
        }

        let deadline = Instant::now() + wait;
        loop {
            let next = if wait.is_zero() {
                match self.buffer.try_recv() {
                    Ok(notification) => notification,
                    Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(QueueError::ListenerStopped(self.id.clone()))
                    }
                }
            } else {
                match tokio::time::timeout_at(deadline, self.buffer.recv()).await {
                    Ok(Some(notification)) => notification,
                    Ok(None) => return Err(QueueError::ListenerStopped(self.id.clone())),
                    Err(_) => return Ok(None),
                }
            };

            if self.backend.is_discarded(next.query_id()).await? {
                self.stats.discarded.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            self.stats.delivered.fetch_add(1, Ordering::SeqCst);
            debug!(listener_id = %self.id, task_key = %next.task_key, "Received task notification");
            return Ok(Some(next));
        }
    }

    /// Stops polling and returns buffered notifications to their queues.
    ///
    /// Returns how many notifications were requeued.
    pub async fn stop(&mut self) -> Result<usize, QueueError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }

        info!(listener_id = %self.id, "Stopping listener");
        // Ignore send error - the poller may already have exited
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(listener_id = %self.id, error = %e, "Listener poller panicked");
            }
        }
        self.registry.unregister(&self.id);

        let mut pending = Vec::new();
        while let Ok(notification) = self.buffer.try_recv() {
            pending.push(notification);
        }

        // requeue pushes to the head, so walk backwards to keep FIFO order
        let mut requeued = 0;
        for notification in pending.iter().rev() {
            if self.backend.is_discarded(notification.query_id()).await? {
                continue;
            }
            if let Err(e) = self.backend.requeue(notification).await {
                warn!(
                    listener_id = %self.id,
                    task_key = %notification.task_key,
                    error = %e,
                    "Failed to requeue buffered notification"
                );
                continue;
            }
            requeued += 1;
        }

        info!(listener_id = %self.id, requeued, "Listener stopped");
        Ok(requeued)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            self.registry.unregister(&self.id);
        }
    }
}

/// Polling task behind a listener.
struct Poller {
    listener_id: String,
    subscription: Arc<Subscription>,
    source: Box<dyn NotificationSource>,
    backend: Arc<dyn QueueBackend>,
    buffer: mpsc::Sender<QueryTaskNotification>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedListenerStats>,
}

impl Poller {
    async fn run(mut self) {
        debug!(listener_id = %self.listener_id, "Listener poller started");
        let mut cursor = 0usize;

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            // only pop while the local buffer has room
            let permit = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                permit = self.buffer.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let pools = self.subscription.rotated(cursor);
            cursor = cursor.wrapping_add(1);
            if pools.is_empty() {
                drop(permit);
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            match self.source.pop(&pools, self.poll_interval).await {
                Ok(Some(notification)) => {
                    self.stats.polled.fetch_add(1, Ordering::SeqCst);
                    match self.backend.is_discarded(notification.query_id()).await {
                        Ok(true) => {
                            self.stats.discarded.fetch_add(1, Ordering::SeqCst);
                            debug!(
                                listener_id = %self.listener_id,
                                task_key = %notification.task_key,
                                "Dropped notification of discarded query"
                            );
                        }
                        Ok(false) => permit.send(notification),
                        Err(e) => {
                            // keep it; receive checks again
                            warn!(listener_id = %self.listener_id, error = %e, "Failed to check discarded query");
                            permit.send(notification);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(listener_id = %self.listener_id, error = %e, "Failed to poll notification queues");
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        debug!(listener_id = %self.listener_id, "Listener poller stopped");
    }
}
