//! In-memory task store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::store::{StoreError, TaskStore};
use crate::model::{
    QueryCheckpoint, QueryLifecycle, QueryPool, QueryStatus, QueryTask, TaskKey, TaskState,
    TaskStates,
};

#[derive(Debug, Default)]
struct Records {
    statuses: HashMap<Uuid, QueryStatus>,
    task_states: HashMap<Uuid, TaskStates>,
    /// Tasks per query, in creation order.
    tasks: HashMap<Uuid, Vec<QueryTask>>,
}

impl Records {
    fn task_mut(&mut self, key: &TaskKey) -> Option<&mut QueryTask> {
        self.tasks
            .get_mut(&key.query_id())?
            .iter_mut()
            .find(|task| task.task_key() == key)
    }
}

/// Task store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: RwLock<Records>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_query(
        &self,
        status: &QueryStatus,
        task_states: &TaskStates,
        task: &QueryTask,
    ) -> Result<(), StoreError> {
        let query_id = status.query_key.query_id;
        let mut records = self.write();
        records.statuses.insert(query_id, status.clone());
        records.task_states.insert(query_id, task_states.clone());
        records
            .tasks
            .entry(query_id)
            .or_default()
            .push(task.clone());
        Ok(())
    }

    async fn create_task(&self, task: &QueryTask) -> Result<bool, StoreError> {
        let key = task.task_key();
        let mut records = self.write();
        let Some(states) = records.task_states.get_mut(&key.query_id()) else {
            return Ok(false);
        };
        states.add_task(key.task_id);
        match records.task_mut(key) {
            Some(existing) => *existing = task.clone(),
            None => records
                .tasks
                .entry(key.query_id())
                .or_default()
                .push(task.clone()),
        }
        Ok(true)
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<QueryTask>, StoreError> {
        Ok(self
            .read()
            .tasks
            .get(&key.query_id())
            .and_then(|tasks| tasks.iter().find(|task| task.task_key() == key))
            .cloned())
    }

    async fn update_checkpoint(
        &self,
        key: &TaskKey,
        checkpoint: &QueryCheckpoint,
    ) -> Result<bool, StoreError> {
        let mut records = self.write();
        match records.task_mut(key) {
            Some(task) => {
                task.replace_checkpoint(checkpoint.clone())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_task(&self, key: &TaskKey) -> Result<bool, StoreError> {
        let mut records = self.write();
        if let Some(states) = records.task_states.get_mut(&key.query_id()) {
            states.remove(&key.task_id);
        }
        let Some(tasks) = records.tasks.get_mut(&key.query_id()) else {
            return Ok(false);
        };
        let before = tasks.len();
        tasks.retain(|task| task.task_key() != key);
        let removed = tasks.len() != before;
        if tasks.is_empty() {
            records.tasks.remove(&key.query_id());
        }
        Ok(removed)
    }

    async fn get_tasks(&self, query_id: Uuid) -> Result<Vec<QueryTask>, StoreError> {
        Ok(self.read().tasks.get(&query_id).cloned().unwrap_or_default())
    }

    async fn get_pool_tasks(&self, pool: &QueryPool) -> Result<Vec<QueryTask>, StoreError> {
        Ok(self
            .read()
            .tasks
            .values()
            .flatten()
            .filter(|task| task.task_key().query_pool() == pool)
            .cloned()
            .collect())
    }

    async fn delete_query(&self, query_id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.write();
        let had_status = records.statuses.remove(&query_id).is_some();
        let had_states = records.task_states.remove(&query_id).is_some();
        let had_tasks = records.tasks.remove(&query_id).is_some();
        Ok(had_status || had_states || had_tasks)
    }

    async fn get_query_status(&self, query_id: Uuid) -> Result<Option<QueryStatus>, StoreError> {
        Ok(self.read().statuses.get(&query_id).cloned())
    }

    async fn get_query_statuses(&self) -> Result<Vec<QueryStatus>, StoreError> {
        let mut statuses: Vec<QueryStatus> = self.read().statuses.values().cloned().collect();
        statuses.sort_by_key(|status| status.created_at);
        Ok(statuses)
    }

    async fn put_query_status(&self, status: &QueryStatus) -> Result<(), StoreError> {
        self.write()
            .statuses
            .insert(status.query_key.query_id, status.clone());
        Ok(())
    }

    async fn update_query_lifecycle(
        &self,
        query_id: Uuid,
        lifecycle: QueryLifecycle,
    ) -> Result<Option<QueryStatus>, StoreError> {
        let mut records = self.write();
        Ok(records.statuses.get_mut(&query_id).map(|status| {
            status.transition(lifecycle);
            status.clone()
        }))
    }

    async fn get_task_states(&self, query_id: Uuid) -> Result<Option<TaskStates>, StoreError> {
        Ok(self.read().task_states.get(&query_id).cloned())
    }

    async fn update_task_state(
        &self,
        key: &TaskKey,
        state: TaskState,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .write()
            .task_states
            .get_mut(&key.query_id())
            .and_then(|states| states.set_state(key.task_id, state)))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.write() = Records::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QueryAction, QueryKey};

    fn query() -> (QueryStatus, TaskStates, QueryTask) {
        let query_key = QueryKey::generate("pool", "EventQuery");
        let task = QueryTask::new(QueryAction::Create, QueryCheckpoint::empty(query_key.clone()));
        let mut states = TaskStates::new(query_key.clone(), 2);
        states.add_task(task.task_key().task_id);
        (QueryStatus::new(query_key), states, task)
    }

    #[tokio::test]
    async fn test_create_and_delete_query() {
        let store = MemoryTaskStore::new();
        let (status, states, task) = query();
        let query_id = status.query_key.query_id;
        store.create_query(&status, &states, &task).await.unwrap();

        assert_eq!(store.get_task(task.task_key()).await.unwrap(), Some(task.clone()));
        assert_eq!(store.get_tasks(query_id).await.unwrap().len(), 1);
        assert_eq!(store.get_query_status(query_id).await.unwrap(), Some(status));

        assert!(store.delete_query(query_id).await.unwrap());
        assert!(store.get_tasks(query_id).await.unwrap().is_empty());
        assert_eq!(store.get_task_states(query_id).await.unwrap(), None);
        assert!(!store.delete_query(query_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_task_marks_ready() {
        let store = MemoryTaskStore::new();
        let (status, states, first) = query();
        store.create_query(&status, &states, &first).await.unwrap();

        let next = QueryTask::new(QueryAction::Next, QueryCheckpoint::empty(status.query_key.clone()));
        assert!(store.create_task(&next).await.unwrap());

        let states = store
            .get_task_states(status.query_key.query_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(states.state(&next.task_key().task_id), Some(TaskState::Ready));
        let tasks = store.get_tasks(status.query_key.query_id).await.unwrap();
        assert_eq!(tasks, vec![first, next]);
    }

    #[tokio::test]
    async fn test_checkpoint_of_missing_task() {
        let store = MemoryTaskStore::new();
        let key = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));
        let checkpoint = QueryCheckpoint::empty(key.query_key.clone());
        assert!(!store.update_checkpoint(&key, &checkpoint).await.unwrap());
        assert!(!store.delete_task(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_task_state_respects_cap() {
        let store = MemoryTaskStore::new();
        let (status, states, task) = query();
        store.create_query(&status, &states, &task).await.unwrap();
        let query_key = status.query_key.clone();

        let others: Vec<QueryTask> = (0..2)
            .map(|_| QueryTask::new(QueryAction::Next, QueryCheckpoint::empty(query_key.clone())))
            .collect();
        for other in &others {
            assert!(store.create_task(other).await.unwrap());
        }

        assert_eq!(store.update_task_state(task.task_key(), TaskState::Running).await.unwrap(), Some(true));
        assert_eq!(store.update_task_state(others[0].task_key(), TaskState::Running).await.unwrap(), Some(true));
        assert_eq!(store.update_task_state(others[1].task_key(), TaskState::Running).await.unwrap(), Some(false));

        let unknown = TaskKey::generate(QueryKey::generate("pool", "EventQuery"));
        assert_eq!(store.update_task_state(&unknown, TaskState::Running).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_task_state_rejects_unregistered_task() {
        let store = MemoryTaskStore::new();
        let query_key = QueryKey::generate("pool", "EventQuery");
        let task = QueryTask::new(QueryAction::Create, QueryCheckpoint::empty(query_key.clone()));
        let mut states = TaskStates::new(query_key.clone(), 1);
        states.add_task(task.task_key().task_id);
        store
            .create_query(&QueryStatus::new(query_key.clone()), &states, &task)
            .await
            .unwrap();

        let never_created = TaskKey::generate(query_key.clone());
        assert_eq!(store.update_task_state(&never_created, TaskState::Running).await.unwrap(), None);
        assert_eq!(store.update_task_state(task.task_key(), TaskState::Running).await.unwrap(), Some(true));

        let states = store.get_task_states(query_key.query_id).await.unwrap().unwrap();
        assert_eq!(states.state(&never_created.task_id), None);
    }

    #[tokio::test]
    async fn test_create_task_after_delete_query_stores_nothing() {
        let store = MemoryTaskStore::new();
        let (status, states, first) = query();
        let query_id = status.query_key.query_id;
        store.create_query(&status, &states, &first).await.unwrap();
        assert!(store.delete_query(query_id).await.unwrap());

        let next = QueryTask::new(QueryAction::Next, QueryCheckpoint::empty(status.query_key.clone()));
        assert!(!store.create_task(&next).await.unwrap());
        assert!(store.get_tasks(query_id).await.unwrap().is_empty());
        assert_eq!(store.get_task(next.task_key()).await.unwrap(), None);
        assert!(store.get_pool_tasks(&QueryPool::from("pool")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_tasks_and_lifecycle() {
        let store = MemoryTaskStore::new();
        let (status, states, task) = query();
        store.create_query(&status, &states, &task).await.unwrap();

        assert_eq!(store.get_pool_tasks(&QueryPool::from("pool")).await.unwrap().len(), 1);
        assert!(store.get_pool_tasks(&QueryPool::from("other")).await.unwrap().is_empty());

        let updated = store
            .update_query_lifecycle(status.query_key.query_id, QueryLifecycle::Closed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.lifecycle, QueryLifecycle::Closed);
        assert_eq!(
            store.update_query_lifecycle(Uuid::new_v4(), QueryLifecycle::Closed).await.unwrap(),
            None
        );
    }
}
