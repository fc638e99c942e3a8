//! Bounded-concurrency task queue with identity deduplication.
//!
//! Callers enqueue logical tasks; the worker loop consumes them under a
//! semaphore. Each task carries an identity key, and a key that is already
//! queued or running refuses further enqueues until the task completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

const CHANNEL_BUFFER: usize = 100;

/// Which repositories a reconcile pass covers.
#[derive(Debug, Clone)]
pub enum ReconcileScope {
    All,
    Subset(Vec<i64>),
}

/// A logical unit of work for the worker loop.
#[derive(Debug, Clone)]
pub enum Task {
    /// Clone the mirror if missing, otherwise fetch, fast-forward and
    /// snapshot. Used for both initial capture and routine updates.
    EnsureMirrored(i64),
    /// Fan out EnsureMirrored over every eligible repository.
    UpdateAll { include_archived: bool },
    /// Reconcile upstream lifecycle state through the forge API.
    Reconcile(ReconcileScope),
    /// Cancel every active task. Handled by the loop itself, without a
    /// permit, so it cannot be starved by running work.
    StopAll,
}

/// Identity key used for deduplication: per-repo tasks key on the repo id,
/// global tasks on a well-known constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Repo(i64),
    UpdateAll,
    Reconcile,
}

impl Task {
    #[must_use]
    pub fn key(&self) -> Option<TaskKey> {
        match self {
            Task::EnsureMirrored(id) => Some(TaskKey::Repo(*id)),
            Task::UpdateAll { .. } => Some(TaskKey::UpdateAll),
            Task::Reconcile(_) => Some(TaskKey::Reconcile),
            Task::StopAll => None,
        }
    }
}

struct TaskEntry {
    token: CancellationToken,
    running: bool,
}

/// Counts reported by [`TaskManager::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub active: usize,
    pub queued: usize,
}

pub struct TaskManager {
    tx: mpsc::Sender<Task>,
    entries: Mutex<HashMap<TaskKey, TaskEntry>>,
    pub(crate) semaphore: Arc<Semaphore>,
}

impl TaskManager {
    /// Creates a manager with `max_concurrent` worker permits (clamped to
    /// 1..=16) and returns the channel receiver for the worker loop.
    pub fn new(max_concurrent: u32) -> (Arc<Self>, mpsc::Receiver<Task>) {
        let permits = max_concurrent.clamp(1, 16) as usize;
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

        let manager = Arc::new(Self {
            tx,
            entries: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(permits)),
        });

        (manager, rx)
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, TaskEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a task, refusing with [`Error::AlreadyInProgress`] when its
    /// identity key is already registered as queued or active.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let key = match task.key() {
            Some(key) => key,
            None => {
                // StopAll bypasses registration entirely.
                self.tx.send(task).await.map_err(|_| Error::Cancelled)?;
                return Ok(());
            }
        };

        {
            let mut entries = self.entries();
            if entries.contains_key(&key) {
                return Err(Error::AlreadyInProgress);
            }
            entries.insert(
                key,
                TaskEntry {
                    token: CancellationToken::new(),
                    running: false,
                },
            );
        }

        if self.tx.send(task).await.is_err() {
            self.entries().remove(&key);
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Marks a dequeued task as holding a worker permit.
    pub(crate) fn mark_running(&self, key: TaskKey) {
        if let Some(entry) = self.entries().get_mut(&key) {
            entry.running = true;
        }
    }

    /// Releases a task's identity key once it has finished, whatever the
    /// outcome.
    pub fn mark_complete(&self, key: TaskKey) {
        self.entries().remove(&key);
    }

    /// Returns the cancellation token registered for `key`, if the task is
    /// still queued or active.
    #[must_use]
    pub fn cancellation_token(&self, key: TaskKey) -> Option<CancellationToken> {
        self.entries().get(&key).map(|entry| entry.token.clone())
    }

    /// Triggers cancellation for one task. Idempotent; unknown keys are a
    /// no-op. The entry itself is removed by the worker on completion.
    pub fn cancel(&self, key: TaskKey) {
        if let Some(entry) = self.entries().get(&key) {
            entry.token.cancel();
        }
    }

    /// Triggers cancellation for every registered task.
    pub fn cancel_all(&self) {
        for entry in self.entries().values() {
            entry.token.cancel();
        }
    }

    #[must_use]
    pub fn is_registered(&self, key: TaskKey) -> bool {
        self.entries().contains_key(&key)
    }

    /// Point-in-time queue counts.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let entries = self.entries();
        let active = entries.values().filter(|e| e.running).count();
        QueueSnapshot {
            active,
            queued: entries.len() - active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_and_receive() {
        let (manager, mut rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();

        let task = rx.try_recv().unwrap();
        assert!(matches!(task, Task::EnsureMirrored(1)));
    }

    #[tokio::test]
    async fn test_duplicate_repo_key_refused() {
        let (manager, _rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();
        let err = manager.enqueue(Task::EnsureMirrored(1)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInProgress));

        // A different repo id is fine.
        manager.enqueue(Task::EnsureMirrored(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_global_keys_dedup() {
        let (manager, _rx) = TaskManager::new(4);

        manager
            .enqueue(Task::Reconcile(ReconcileScope::All))
            .await
            .unwrap();
        let err = manager
            .enqueue(Task::Reconcile(ReconcileScope::Subset(vec![1])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInProgress));

        // UpdateAll uses its own key, so it still goes through.
        manager
            .enqueue(Task::UpdateAll {
                include_archived: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_key_freed_after_completion() {
        let (manager, _rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();
        manager.mark_complete(TaskKey::Repo(1));
        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_triggers_token_but_keeps_registration() {
        let (manager, _rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(7)).await.unwrap();
        let token = manager.cancellation_token(TaskKey::Repo(7)).unwrap();
        assert!(!token.is_cancelled());

        manager.cancel(TaskKey::Repo(7));
        assert!(token.is_cancelled());
        // Still registered until the worker observes the cancellation, so
        // re-enqueueing during teardown is refused.
        assert!(manager.is_registered(TaskKey::Repo(7)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_key_noop() {
        let (manager, _rx) = TaskManager::new(4);
        manager.cancel(TaskKey::Repo(999));
        assert_eq!(manager.snapshot(), QueueSnapshot { active: 0, queued: 0 });
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (manager, _rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();
        manager.enqueue(Task::EnsureMirrored(2)).await.unwrap();

        let t1 = manager.cancellation_token(TaskKey::Repo(1)).unwrap();
        let t2 = manager.cancellation_token(TaskKey::Repo(2)).unwrap();

        manager.cancel_all();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[tokio::test]
    async fn test_snapshot_counts_active_and_queued() {
        let (manager, _rx) = TaskManager::new(4);

        manager.enqueue(Task::EnsureMirrored(1)).await.unwrap();
        manager.enqueue(Task::EnsureMirrored(2)).await.unwrap();
        assert_eq!(manager.snapshot(), QueueSnapshot { active: 0, queued: 2 });

        manager.mark_running(TaskKey::Repo(1));
        assert_eq!(manager.snapshot(), QueueSnapshot { active: 1, queued: 1 });

        manager.mark_complete(TaskKey::Repo(1));
        assert_eq!(manager.snapshot(), QueueSnapshot { active: 0, queued: 1 });
    }

    #[tokio::test]
    async fn test_stop_all_not_registered() {
        let (manager, mut rx) = TaskManager::new(4);

        manager.enqueue(Task::StopAll).await.unwrap();
        manager.enqueue(Task::StopAll).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), Task::StopAll));
        assert!(matches!(rx.try_recv().unwrap(), Task::StopAll));
        assert_eq!(manager.snapshot(), QueueSnapshot { active: 0, queued: 0 });
    }

    #[tokio::test]
    async fn test_semaphore_clamping() {
        let (manager, _rx) = TaskManager::new(0);
        assert!(manager.semaphore.try_acquire().is_ok());
        assert!(manager.semaphore.try_acquire().is_err());

        let (manager, _rx) = TaskManager::new(100);
        let mut permits = Vec::new();
        for _ in 0..16 {
            permits.push(manager.semaphore.try_acquire().unwrap());
        }
        assert!(manager.semaphore.try_acquire().is_err());
    }
}
