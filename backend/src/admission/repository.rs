//! Task repository abstraction and its in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bigmodel_common::{Task, TaskId, TaskOutcome, TaskStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from a [`TaskRepository`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Storage for batch tasks.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), RepositoryError>;

    async fn get(&self, id: TaskId) -> Result<Task, RepositoryError>;

    /// Waiting tasks of `kind` created strictly before `before`, oldest first.
    async fn get_waiting_tasks(
        &self,
        kind: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// Claim a waiting task for execution.
    ///
    /// Returns `false` if the task is no longer waiting.
    async fn mark_running(&self, id: TaskId) -> Result<bool, RepositoryError>;

    /// Put a claimed task back in the queue.
    async fn reset_waiting(&self, id: TaskId) -> Result<(), RepositoryError>;

    /// Record the outcome of a running task.
    async fn complete(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), RepositoryError>;

    /// 1-based queue position of the owner's oldest waiting task, 0 if none.
    async fn waiting_rank(&self, owner: &str, kind: &str) -> Result<usize, RepositoryError>;

    /// The owner's most recently created finished task.
    async fn last_finished(&self, owner: &str, kind: &str) -> Result<Option<Task>, RepositoryError>;
}

/// Repository holding tasks in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn transition(task: &mut Task, from: TaskStatus, to: TaskStatus) -> Result<(), RepositoryError> {
        if task.status != from {
            return Err(RepositoryError::InvalidTransition {
                id: task.id,
                from: task.status,
                to,
            });
        }
        task.status = to;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert(&self, task: Task) -> Result<(), RepositoryError> {
        self.tasks.write().await.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task, RepositoryError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn get_waiting_tasks(
        &self,
        kind: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut waiting: Vec<Task> = tasks
            .values()
            .filter(|t| t.kind == kind && t.is_waiting() && t.created_at < before)
            .cloned()
            .collect();
        waiting.sort_by_key(|t| t.created_at);
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn mark_running(&self, id: TaskId) -> Result<bool, RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        if !task.is_waiting() {
            return Ok(false);
        }
        task.status = TaskStatus::Running;
        Ok(true)
    }

    async fn reset_waiting(&self, id: TaskId) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        Self::transition(task, TaskStatus::Running, TaskStatus::Waiting)
    }

    async fn complete(&self, id: TaskId, outcome: TaskOutcome) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        Self::transition(task, TaskStatus::Running, outcome.status())?;

        task.finished_at = Some(Utc::now());
        match outcome {
            TaskOutcome::Finished(output) => task.output = Some(output),
            TaskOutcome::Failed(error) => task.error = Some(error),
        }
        Ok(())
    }

    async fn waiting_rank(&self, owner: &str, kind: &str) -> Result<usize, RepositoryError> {
        let tasks = self.tasks.read().await;
        let mut waiting: Vec<&Task> = tasks
            .values()
            .filter(|t| t.kind == kind && t.is_waiting())
            .collect();
        waiting.sort_by_key(|t| t.created_at);

        Ok(waiting
            .iter()
            .position(|t| t.owner == owner)
            .map(|i| i + 1)
            .unwrap_or(0))
    }

    async fn last_finished(&self, owner: &str, kind: &str) -> Result<Option<Task>, RepositoryError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.owner == owner && t.kind == kind && t.status == TaskStatus::Finished)
            .max_by_key(|t| t.created_at)
            .cloned())
    }
}
