//! Task registry for long running operations.
//!
//! Every spawned operation gets a UUID, a RUNNING record visible before its
//! work starts and a [`CancellationToken`] it is expected to poll. The
//! registry only flags cancellation; the work decides where to stop.
//! Terminal records stay listable for the retention window, then are purged
//! lazily on the next registry access.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default time a finished task stays listable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A task named {name} is already running")]
    DuplicateTask { name: String },

    #[error("No running or retained task with id {id}")]
    UnknownTask { id: String },
}

/// Failure reported by task work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("execution failed: {error}")]
    Fail { error: String },

    #[error("context cancelled")]
    Canceled,
}

impl TaskError {
    pub fn fail(error: impl fmt::Display) -> Self {
        TaskError::Fail {
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Race,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Point-in-time copy of a task record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handle given to task work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: String,
    name: String,
    token: CancellationToken,
}

impl TaskContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token to hand to code that waits cooperatively.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

struct TaskEntry {
    snapshot: TaskSnapshot,
    seq: u64,
    token: CancellationToken,
    finished: Option<Instant>,
}

#[derive(Default)]
struct RegistryInner {
    tasks: HashMap<String, TaskEntry>,
    next_seq: u64,
}

impl RegistryInner {
    fn purge_expired(&mut self, retention: Duration) {
        let now = Instant::now();
        self.tasks.retain(|_, entry| {
            entry
                .finished
                .is_none_or(|finished| now.duration_since(finished) < retention)
        });
    }

    fn finish(&mut self, id: &str, status: TaskStatus) {
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.snapshot.status = status;
            entry.snapshot.finished_at = Some(Utc::now());
            entry.finished = Some(Instant::now());
        }
    }
}

/// Registry of spawned tasks.
pub struct TaskRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    retention: Duration,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl TaskRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            retention,
        }
    }

    /// Spawns `work` on the runtime and returns the new task id.
    ///
    /// The task is recorded as RUNNING before `work` is polled. A panic inside
    /// `work` marks the task FAILED.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateTask` - A RUNNING task already uses `name`
    pub fn spawn<F, Fut>(
        &self,
        kind: TaskKind,
        name: impl Into<String>,
        work: F,
    ) -> Result<String, RegistryError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let name = name.into();
        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();

        {
            let mut inner = self.inner.lock();
            inner.purge_expired(self.retention);
            let running = inner.tasks.values().any(|entry| {
                entry.snapshot.name == name && !entry.snapshot.status.is_terminal()
            });
            if running {
                return Err(RegistryError::DuplicateTask { name });
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.tasks.insert(
                id.clone(),
                TaskEntry {
                    snapshot: TaskSnapshot {
                        id: id.clone(),
                        name: name.clone(),
                        kind,
                        status: TaskStatus::Running,
                        cancel_requested: false,
                        created_at: Utc::now(),
                        finished_at: None,
                    },
                    seq,
                    token: token.clone(),
                    finished: None,
                },
            );
        }

        tracing::info!("Spawned task {} [{}]", id, name);

        let context = TaskContext {
            id: id.clone(),
            name,
            token,
        };
        let inner = Arc::clone(&self.inner);
        let task_id = id.clone();
        tokio::spawn(async move {
            let status = match tokio::spawn(work(context)).await {
                Ok(Ok(())) => TaskStatus::Succeeded,
                Ok(Err(TaskError::Canceled)) => TaskStatus::Cancelled,
                Ok(Err(TaskError::Fail { error })) => TaskStatus::Failed(error),
                Err(join_error) if join_error.is_panic() => {
                    TaskStatus::Failed(format!("panicked: {}", panic_message(join_error)))
                }
                Err(_) => TaskStatus::Cancelled,
            };
            tracing::info!("Task {} finished: {:?}", task_id, status);
            inner.lock().finish(&task_id, status);
        });

        Ok(id)
    }

    /// Requests cooperative cancellation. Repeated calls are no-ops.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownTask` - Task absent, purged or already terminal
    pub fn cancel(&self, id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(self.retention);
        match inner.tasks.get_mut(id) {
            Some(entry) if !entry.snapshot.status.is_terminal() => {
                if !entry.snapshot.cancel_requested {
                    tracing::info!("Cancellation requested for task {}", id);
                }
                entry.snapshot.cancel_requested = true;
                entry.token.cancel();
                Ok(())
            }
            _ => Err(RegistryError::UnknownTask { id: id.to_string() }),
        }
    }

    /// Flags every running task for cancellation, returning how many.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut cancelled = 0;
        for entry in inner.tasks.values_mut() {
            if !entry.snapshot.status.is_terminal() {
                entry.snapshot.cancel_requested = true;
                entry.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// # Errors
    ///
    /// - `RegistryError::UnknownTask` - Task absent or purged
    pub fn status(&self, id: &str) -> Result<TaskSnapshot, RegistryError> {
        let mut inner = self.inner.lock();
        inner.purge_expired(self.retention);
        inner
            .tasks
            .get(id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| RegistryError::UnknownTask { id: id.to_string() })
    }

    /// All retained tasks in creation order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        let mut inner = self.inner.lock();
        inner.purge_expired(self.retention);
        let mut entries: Vec<&TaskEntry> = inner.tasks.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| entry.snapshot.clone())
            .collect()
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_terminal(registry: &TaskRegistry, id: &str) -> TaskSnapshot {
        loop {
            let snapshot = registry.status(id).unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn explodes(_ctx: TaskContext) -> Result<(), TaskError> {
        panic!("boom")
    }

    async fn until_cancelled(ctx: TaskContext) -> Result<(), TaskError> {
        ctx.token().cancelled().await;
        Err(TaskError::Canceled)
    }

    #[tokio::test]
    async fn test_spawn_records_running_before_work() {
        let registry = TaskRegistry::default();
        let id = registry
            .spawn(TaskKind::Race, "hash", until_cancelled)
            .unwrap();

        let snapshot = registry.status(&id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert_eq!(snapshot.name, "hash");
        assert!(!snapshot.cancel_requested);

        registry.cancel(&id).unwrap();
        let finished = wait_terminal(&registry, &id).await;
        assert_eq!(finished.status, TaskStatus::Cancelled);
        assert!(finished.cancel_requested);
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_name_only_while_running() {
        let registry = TaskRegistry::default();
        let first = registry
            .spawn(TaskKind::Race, "hash", until_cancelled)
            .unwrap();

        let duplicate = registry.spawn(TaskKind::Race, "hash", until_cancelled);
        assert!(matches!(duplicate, Err(RegistryError::DuplicateTask { name }) if name == "hash"));

        registry.cancel(&first).unwrap();
        wait_terminal(&registry, &first).await;

        let second = registry
            .spawn(TaskKind::Race, "hash", |_| async { Ok::<_, TaskError>(()) })
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_then_unknown_once_terminal() {
        let registry = TaskRegistry::default();
        let id = registry
            .spawn(TaskKind::Other, "slow", until_cancelled)
            .unwrap();

        registry.cancel(&id).unwrap();
        registry.cancel(&id).unwrap();
        wait_terminal(&registry, &id).await;

        assert!(matches!(
            registry.cancel(&id),
            Err(RegistryError::UnknownTask { .. })
        ));
        assert!(matches!(
            registry.cancel("nope"),
            Err(RegistryError::UnknownTask { .. })
        ));
        assert!(matches!(
            registry.status("nope"),
            Err(RegistryError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_failed() {
        let registry = TaskRegistry::default();
        let failed = registry
            .spawn(TaskKind::Other, "fails", |_| async {
                Err::<(), _>(TaskError::fail("limit reached"))
            })
            .unwrap();
        let panicked = registry
            .spawn(TaskKind::Other, "panics", explodes)
            .unwrap();

        assert_eq!(
            wait_terminal(&registry, &failed).await.status,
            TaskStatus::Failed("limit reached".to_string())
        );
        assert_eq!(
            wait_terminal(&registry, &panicked).await.status,
            TaskStatus::Failed("panicked: boom".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_in_creation_order_and_cancel_all() {
        let registry = TaskRegistry::default();
        let ids: Vec<String> = ["c", "a", "b"]
            .iter()
            .map(|name| registry.spawn(TaskKind::Race, *name, until_cancelled).unwrap())
            .collect();

        let listed: Vec<String> = registry.list().into_iter().map(|task| task.id).collect();
        assert_eq!(listed, ids);

        assert_eq!(registry.cancel_all(), 3);
        for id in &ids {
            assert_eq!(wait_terminal(&registry, id).await.status, TaskStatus::Cancelled);
        }
        assert_eq!(registry.cancel_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_tasks_purged_after_retention() {
        let registry = TaskRegistry::new(Duration::from_secs(60));
        let id = registry
            .spawn(TaskKind::Other, "quick", |_| async { Ok::<_, TaskError>(()) })
            .unwrap();
        assert_eq!(wait_terminal(&registry, &id).await.status, TaskStatus::Succeeded);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(registry.list().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.list().is_empty());
        assert!(matches!(
            registry.status(&id),
            Err(RegistryError::UnknownTask { .. })
        ));
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let failed = serde_json::to_value(TaskStatus::Failed("gone".to_string())).unwrap();
        assert_eq!(failed, serde_json::json!({"state": "FAILED", "reason": "gone"}));
        let running = serde_json::to_value(TaskStatus::Running).unwrap();
        assert_eq!(running, serde_json::json!({"state": "RUNNING"}));
    }
}
