//! Execution of a single batch task.

use async_trait::async_trait;
use bigmodel_common::{Task, TaskOutcome};

use crate::relay::{JsonPassthrough, OneShotClient};

/// Runs one task to an outcome.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> TaskOutcome;
}

/// Posts the task payload to an endpoint of the task's kind.
///
/// Waits for an endpoint the way the kind's pool is configured to.
pub struct InferenceTaskExecutor {
    client: OneShotClient<JsonPassthrough>,
}

impl InferenceTaskExecutor {
    pub fn new(client: OneShotClient<JsonPassthrough>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskExecutor for InferenceTaskExecutor {
    async fn execute(&self, task: &Task) -> TaskOutcome {
        let mode = match self.client.default_mode(&task.kind) {
            Ok(mode) => mode,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        match self.client.invoke(&task.kind, &task.payload, mode).await {
            Ok(output) => TaskOutcome::Finished(output),
            Err(e) => {
                tracing::warn!("Task {} ({}) failed: {}", task.id, task.kind, e);
                TaskOutcome::Failed(e.to_string())
            }
        }
    }
}
