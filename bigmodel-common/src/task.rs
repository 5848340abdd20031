//! Batch task model.
//!
//! Tasks are created by request handling, moved from `waiting` to `running`
//! by the admission controller and finished by the worker that executes them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier.
pub type TaskId = Uuid;

/// Lifecycle state of a batch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }

    /// Finished and error are terminal; nothing moves a task out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown task status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTaskStatus(pub String);

impl fmt::Display for UnknownTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown task status: {}", self.0)
    }
}

impl std::error::Error for UnknownTaskStatus {}

impl FromStr for TaskStatus {
    type Err = UnknownTaskStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "running" => Ok(TaskStatus::Running),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            other => Err(UnknownTaskStatus(other.to_string())),
        }
    }
}

/// A unit of queued batch work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Model kind; selects the endpoint pool the task runs against.
    pub kind: String,
    /// Account that submitted the task.
    pub owner: String,
    /// Request body forwarded to the upstream endpoint.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Upstream response recorded when the task finishes.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Failure text recorded when the task errors.
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// Create a waiting task stamped with the current time.
    pub fn new(kind: impl Into<String>, owner: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            owner: owner.into(),
            payload,
            status: TaskStatus::Waiting,
            created_at: Utc::now(),
            finished_at: None,
            output: None,
            error: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_waiting(&self) -> bool {
        self.status == TaskStatus::Waiting
    }
}

/// Result of executing a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Finished(serde_json::Value),
    Failed(String),
}

impl TaskOutcome {
    /// The terminal status this outcome moves the task to.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Finished(_) => TaskStatus::Finished,
            TaskOutcome::Failed(_) => TaskStatus::Error,
        }
    }
}
