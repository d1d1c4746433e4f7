//! Retry task records and the durable store contract.
//!
//! The store is the single source of truth for which tasks exist. The engine
//! never caches records across ticks; it re-reads `list_pending` every time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ns, Kv, KvSerde};

/// Identifier of one persisted retry task (UUIDv7, time ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Fresh id for a task created now.
    pub fn new() -> Self {
        TaskId(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a persisted task. Success deletes the record, so there is no
/// terminal variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for the next tick.
    Pending,
    /// Picked up by a tick that has not finished with it yet.
    Retrying,
}

/// One failed invocation's argument, waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    /// Task id.
    pub id: TaskId,
    /// Identity of the handler that owns the task.
    pub identity: String,
    /// Codec-encoded argument.
    pub payload: Vec<u8>,
    /// Current state.
    pub state: TaskState,
    /// Number of failed replays so far.
    pub attempts: u32,
    /// When the original invocation failed (or was about to run).
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl RetryTask {
    fn new(identity: &str, payload: &[u8]) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            identity: identity.to_string(),
            payload: payload.to_vec(),
            state: TaskState::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// `RETRYING` left behind by a crash or forced stop reads back as `PENDING`.
    fn reconciled(mut self) -> Self {
        self.state = TaskState::Pending;
        self
    }
}

/// Durable task store consumed by the failure-capture wrapper and the retry
/// processor.
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a new `PENDING` task and return its id.
    fn save(&self, identity: &str, payload: &[u8]) -> Result<TaskId, StoreError>;

    /// All replayable tasks of `identity` in insertion order. Records found in
    /// `RETRYING` are returned as `PENDING`.
    fn list_pending(&self, identity: &str) -> Result<Vec<RetryTask>, StoreError>;

    /// Flag a task as picked up by the current tick.
    fn mark_retrying(&self, id: TaskId) -> Result<(), StoreError>;

    /// Remove a task. Deleting an unknown id is not an error.
    fn delete(&self, id: TaskId) -> Result<(), StoreError>;

    /// Put a task back to `PENDING` after a failed replay, counting the attempt.
    fn revert_to_pending(&self, id: TaskId) -> Result<(), StoreError>;

    /// Fetch one task as stored (no reconciliation).
    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, StoreError>;

    /// Number of tasks currently held for `identity`.
    fn count(&self, identity: &str) -> Result<usize, StoreError> {
        Ok(self.list_pending(identity)?.len())
    }
}

/* --------------------- in-memory store --------------------- */

/// Process-local store; tasks do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<RetryTask>>,
}

impl MemoryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tasks<R>(&self, f: impl FnOnce(&mut Vec<RetryTask>) -> R) -> Result<R, StoreError> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        Ok(f(&mut tasks))
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut RetryTask)) -> Result<(), StoreError> {
        self.with_tasks(|tasks| match tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                f(task);
                task.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        })?
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, identity: &str, payload: &[u8]) -> Result<TaskId, StoreError> {
        let task = RetryTask::new(identity, payload);
        let id = task.id;
        self.with_tasks(|tasks| tasks.push(task))?;
        Ok(id)
    }

    fn list_pending(&self, identity: &str) -> Result<Vec<RetryTask>, StoreError> {
        self.with_tasks(|tasks| {
            tasks
                .iter()
                .filter(|t| t.identity == identity)
                .cloned()
                .map(RetryTask::reconciled)
                .collect()
        })
    }

    fn mark_retrying(&self, id: TaskId) -> Result<(), StoreError> {
        self.update(id, |t| t.state = TaskState::Retrying)
    }

    fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.with_tasks(|tasks| tasks.retain(|t| t.id != id))
    }

    fn revert_to_pending(&self, id: TaskId) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.state = TaskState::Pending;
            t.attempts = t.attempts.saturating_add(1);
        })
    }

    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, StoreError> {
        self.with_tasks(|tasks| tasks.iter().find(|t| t.id == id).cloned())
    }
}

/* --------------------- KV-backed store --------------------- */

/// Durable store on top of a [`Kv`] engine.
///
/// Layout: `task:{id}` holds the bincode record, `index:{identity}` holds the
/// ids of that identity in insertion order.
pub struct KvTaskStore<K: Kv> {
    kv: K,
    // Serializes read-modify-write of index entries within this process.
    index_lock: Mutex<()>,
}

impl<K: Kv> KvTaskStore<K> {
    /// Wrap a KV engine.
    pub fn new(kv: K) -> Self {
        Self { kv, index_lock: Mutex::new(()) }
    }

    fn task_key(id: TaskId) -> Vec<u8> {
        ns("task", &id.to_string())
    }

    fn index_key(identity: &str) -> Vec<u8> {
        ns("index", identity)
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.index_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("index lock poisoned".into()))
    }

    fn load(&self, id: TaskId) -> Result<RetryTask, StoreError> {
        self.kv
            .get_t::<RetryTask>(&Self::task_key(id))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update(&self, id: TaskId, f: impl FnOnce(&mut RetryTask)) -> Result<(), StoreError> {
        let mut task = self.load(id)?;
        f(&mut task);
        task.updated_at = Utc::now();
        self.kv.put_t(&Self::task_key(id), &task)
    }
}

impl<K: Kv> TaskStore for KvTaskStore<K> {
    fn save(&self, identity: &str, payload: &[u8]) -> Result<TaskId, StoreError> {
        let task = RetryTask::new(identity, payload);
        self.kv.put_t(&Self::task_key(task.id), &task)?;

        let _guard = self.lock_index()?;
        let key = Self::index_key(identity);
        let mut ids: Vec<TaskId> = self.kv.get_t(&key)?.unwrap_or_default();
        ids.push(task.id);
        self.kv.put_t(&key, &ids)?;
        Ok(task.id)
    }

    fn list_pending(&self, identity: &str) -> Result<Vec<RetryTask>, StoreError> {
        let ids: Vec<TaskId> = {
            let _guard = self.lock_index()?;
            self.kv.get_t(&Self::index_key(identity))?.unwrap_or_default()
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            // An index entry may outlive its record if a delete was interrupted.
            if let Some(task) = self.kv.get_t::<RetryTask>(&Self::task_key(id))? {
                out.push(task.reconciled());
            }
        }
        Ok(out)
    }

    fn mark_retrying(&self, id: TaskId) -> Result<(), StoreError> {
        self.update(id, |t| t.state = TaskState::Retrying)
    }

    fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let Some(task) = self.kv.get_t::<RetryTask>(&Self::task_key(id))? else {
            return Ok(());
        };
        let _guard = self.lock_index()?;
        let key = Self::index_key(&task.identity);
        let mut ids: Vec<TaskId> = self.kv.get_t(&key)?.unwrap_or_default();
        ids.retain(|i| *i != id);
        if ids.is_empty() {
            self.kv.delete(&key)?;
        } else {
            self.kv.put_t(&key, &ids)?;
        }
        self.kv.delete(&Self::task_key(id))?;
        Ok(())
    }

    fn revert_to_pending(&self, id: TaskId) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.state = TaskState::Pending;
            t.attempts = t.attempts.saturating_add(1);
        })
    }

    fn get(&self, id: TaskId) -> Result<Option<RetryTask>, StoreError> {
        self.kv.get_t(&Self::task_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_fs;

    fn exercise(store: &dyn TaskStore) {
        let a = store.save("orders", b"1").unwrap();
        let b = store.save("orders", b"2").unwrap();
        store.save("refunds", b"x").unwrap();

        let pending = store.list_pending("orders").unwrap();
        assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(store.count("refunds").unwrap(), 1);

        store.mark_retrying(a).unwrap();
        assert_eq!(store.get(a).unwrap().unwrap().state, TaskState::Retrying);

        store.revert_to_pending(a).unwrap();
        let task = store.get(a).unwrap().unwrap();
        assert_eq!((task.state, task.attempts), (TaskState::Pending, 1));

        store.delete(b).unwrap();
        store.delete(b).unwrap();
        assert_eq!(store.count("orders").unwrap(), 1);
        assert!(matches!(store.mark_retrying(b), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryTaskStore::new());
    }

    #[test]
    fn kv_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&KvTaskStore::new(open_fs(dir.path()).unwrap()));
    }

    #[test]
    fn retrying_reads_back_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = KvTaskStore::new(open_fs(dir.path()).unwrap());
            let id = store.save("orders", b"1").unwrap();
            store.mark_retrying(id).unwrap();
            id
        };

        // Reopen as if the process had crashed mid-tick.
        let store = KvTaskStore::new(open_fs(dir.path()).unwrap());
        let pending = store.list_pending("orders").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].state, TaskState::Pending);
    }
}
