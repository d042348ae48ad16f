//! In-process lock backend.
//!
//! Several `LockManager`s sharing one `LocalLockBackend` behave like several
//! executor processes sharing one distributed backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Acquire, LockBackend};
use crate::error::TaskLockError;
use crate::model::TaskKey;

#[derive(Debug, Clone, Copy)]
struct Holder {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Debug)]
struct Semaphore {
    max_concurrency: u32,
    /// Task id to holder; entries past `expires_at` are stale.
    holders: HashMap<Uuid, Holder>,
}

impl Semaphore {
    /// Drops expired holders, returning how many were reclaimed.
    fn reclaim(&mut self, now: Instant) -> usize {
        let before = self.holders.len();
        self.holders.retain(|_, holder| holder.expires_at > now);
        before - self.holders.len()
    }

    fn live_holder(&self, task_id: &Uuid, now: Instant) -> Option<Holder> {
        self.holders
            .get(task_id)
            .filter(|holder| holder.expires_at > now)
            .copied()
    }
}

/// Semaphores and locks kept in memory.
#[derive(Debug, Default)]
pub struct LocalLockBackend {
    semaphores: Mutex<HashMap<Uuid, Semaphore>>,
    released: Notify,
}

impl LocalLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HashMap<Uuid, Semaphore>> {
        self.semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LockBackend for LocalLockBackend {
    async fn create_semaphore(&self, query_id: Uuid, max_concurrency: u32) -> Result<(), TaskLockError> {
        let mut state = self.state();
        state
            .entry(query_id)
            .and_modify(|semaphore| semaphore.max_concurrency = max_concurrency)
            .or_insert_with(|| Semaphore {
                max_concurrency,
                holders: HashMap::new(),
            });
        drop(state);
        // a raised limit may admit waiters
        self.released.notify_waiters();
        Ok(())
    }

    async fn delete_semaphore(&self, query_id: Uuid) -> Result<(), TaskLockError> {
        let removed = self.state().remove(&query_id);
        if removed.is_some() {
            self.released.notify_waiters();
        }
        Ok(())
    }

    async fn semaphore_exists(&self, query_id: Uuid) -> Result<bool, TaskLockError> {
        Ok(self.state().contains_key(&query_id))
    }

    async fn queries(&self) -> Result<HashSet<Uuid>, TaskLockError> {
        Ok(self.state().keys().copied().collect())
    }

    async fn try_acquire(
        &self,
        key: &TaskKey,
        owner: Uuid,
        lease: Duration,
    ) -> Result<Acquire, TaskLockError> {
        let now = Instant::now();
        let mut state = self.state();
        let semaphore = state
            .get_mut(&key.query_id())
            .ok_or(TaskLockError::MissingSemaphore(key.query_id()))?;

        semaphore.reclaim(now);
        if semaphore.holders.contains_key(&key.task_id) {
            return Ok(Acquire::Held);
        }
        if semaphore.holders.len() >= semaphore.max_concurrency as usize {
            return Ok(Acquire::NoPermit {
                max_concurrency: semaphore.max_concurrency,
            });
        }

        semaphore.holders.insert(
            key.task_id,
            Holder {
                owner,
                expires_at: now + lease,
            },
        );
        Ok(Acquire::Acquired)
    }

    async fn release(&self, key: &TaskKey, owner: Option<Uuid>) -> Result<bool, TaskLockError> {
        let now = Instant::now();
        let released = {
            let mut state = self.state();
            let Some(semaphore) = state.get_mut(&key.query_id()) else {
                return Ok(false);
            };
            match (semaphore.live_holder(&key.task_id, now), owner) {
                (Some(_), None) => semaphore.holders.remove(&key.task_id).is_some(),
                (Some(holder), Some(owner)) if holder.owner == owner => {
                    semaphore.holders.remove(&key.task_id).is_some()
                }
                (None, _) => {
                    semaphore.holders.remove(&key.task_id);
                    false
                }
                _ => false,
            }
        };
        if released {
            self.released.notify_waiters();
        }
        Ok(released)
    }

    async fn renew(&self, key: &TaskKey, owner: Uuid, lease: Duration) -> Result<bool, TaskLockError> {
        let now = Instant::now();
        let mut state = self.state();
        let Some(semaphore) = state.get_mut(&key.query_id()) else {
            return Ok(false);
        };
        match semaphore.holders.get_mut(&key.task_id) {
            Some(holder) if holder.owner == owner && holder.expires_at > now => {
                holder.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &TaskKey) -> Result<Option<Uuid>, TaskLockError> {
        let now = Instant::now();
        Ok(self
            .state()
            .get(&key.query_id())
            .and_then(|semaphore| semaphore.live_holder(&key.task_id, now))
            .map(|holder| holder.owner))
    }

    async fn available_permits(&self, query_id: Uuid) -> Result<Option<u32>, TaskLockError> {
        let now = Instant::now();
        let mut state = self.state();
        Ok(state.get_mut(&query_id).map(|semaphore| {
            semaphore.reclaim(now);
            semaphore
                .max_concurrency
                .saturating_sub(semaphore.holders.len() as u32)
        }))
    }

    async fn clear(&self) -> Result<(), TaskLockError> {
        self.state().clear();
        self.released.notify_waiters();
        Ok(())
    }

    async fn wait_for_release(&self, _query_id: Uuid, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.released.notified()).await;
    }
}
