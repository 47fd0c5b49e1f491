//! Task tracker domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an asynchronous task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Submitted but not yet picked up by an executor.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed with a result payload.
    Succeeded,
    /// Completed with an error detail.
    Failed,
}

impl TaskStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal tasks are immutable except for retry linkage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A trackable unit of asynchronous work.
///
/// Tasks are never deleted; they are retained for audit. `attempt_count`
/// increases only through explicit retry, which creates a new task pointing at
/// the failed one via `retry_of`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,

    /// Free-form operation name, e.g. `runbook:node-drain` or `image.import`
    pub kind: String,

    pub status: TaskStatus,

    /// Entity the task operates on (host id, VM id, or "platform")
    pub target: String,

    /// Execution parameters as supplied at submission
    pub parameters: serde_json::Value,

    /// 1-based; incremented only by retry
    pub attempt_count: u32,

    /// Result payload, set when the task succeeds
    pub result: Option<serde_json::Value>,

    /// Error detail, set when the task fails
    pub error: Option<String>,

    /// Non-owning reference to the failed task this one retries
    pub retry_of: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
