//! Task tracker for asynchronous operations.
//!
//! Any operation dispatched asynchronously (runbook execution, image import,
//! migration workflows) is represented as a Task. The tracker owns status
//! bookkeeping; execution itself is supplied by the runbook/import subsystem,
//! which drives `mark_running`/`complete`/`fail`.
//!
//! Terminal tasks are immutable. Retry never mutates the failed task: it
//! creates a fresh one pointing back via `retry_of` with an incremented
//! attempt count. Tasks are never deleted; they are retained for audit.

use crate::error::{Result, StratoError};
use crate::locks::{task_key, LockMap};
use crate::state::StateManager;
use crate::timeline::EventTimeline;
use crate::types::{EventSubjects, EventType, Task, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Tracker for asynchronous tasks.
pub struct TaskTracker {
    state: Arc<StateManager>,
    timeline: Arc<EventTimeline>,
    locks: Arc<LockMap>,
}

impl TaskTracker {
    pub fn new(state: Arc<StateManager>, timeline: Arc<EventTimeline>, locks: Arc<LockMap>) -> Self {
        Self { state, timeline, locks }
    }

    /// Submit a new task in the `pending` state.
    #[instrument(skip(self, parameters), fields(kind = %kind, target = %target))]
    pub async fn submit(
        &self,
        kind: &str,
        target: &str,
        parameters: serde_json::Value,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            status: TaskStatus::Pending,
            target: target.to_string(),
            parameters,
            attempt_count: 1,
            result: None,
            error: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        };
        self.state.insert_task(&task).await?;
        metrics::counter!("strato_tasks_submitted_total", "kind" => kind.to_string()).increment(1);

        self.timeline
            .append(
                EventType::TaskSubmitted,
                EventSubjects::default(),
                format!("task {} ({}) submitted for {}", task.task_id, kind, target),
            )
            .await?;

        Ok(task)
    }

    /// Transition a pending task to `running`.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn mark_running(&self, task_id: &str) -> Result<Task> {
        let _guard = self.locks.lock(&task_key(task_id)).await;

        let mut task = self.state.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(StratoError::InvalidState {
                reason: format!("task {} is {}, not pending", task_id, task.status),
            });
        }
        task.status = TaskStatus::Running;
        task.updated_at = Utc::now();
        self.state.update_task(&task).await?;
        Ok(task)
    }

    /// Transition a running task to `succeeded` with a result payload.
    #[instrument(skip(self, result), fields(task_id = %task_id))]
    pub async fn complete(&self, task_id: &str, result: serde_json::Value) -> Result<Task> {
        let _guard = self.locks.lock(&task_key(task_id)).await;

        let mut task = self.state.get_task(task_id).await?;
        if task.status != TaskStatus::Running {
            return Err(StratoError::InvalidState {
                reason: format!("task {} is {}, not running", task_id, task.status),
            });
        }
        task.status = TaskStatus::Succeeded;
        task.result = Some(result);
        task.updated_at = Utc::now();
        self.state.update_task(&task).await?;

        metrics::counter!("strato_tasks_completed_total", "status" => "succeeded").increment(1);
        info!(kind = %task.kind, "Task succeeded");
        Ok(task)
    }

    /// Transition a pending or running task to `failed` with an error detail.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn fail(&self, task_id: &str, error: &str) -> Result<Task> {
        let _guard = self.locks.lock(&task_key(task_id)).await;

        let mut task = self.state.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(StratoError::InvalidState {
                reason: format!("task {} is already terminal ({})", task_id, task.status),
            });
        }
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();
        self.state.update_task(&task).await?;

        metrics::counter!("strato_tasks_completed_total", "status" => "failed").increment(1);
        Ok(task)
    }

    /// Retry a failed task.
    ///
    /// Only legal when the referenced task is terminal-failed; creates a new
    /// pending task with `retry_of` set and `attempt_count` incremented. The
    /// failed task itself is left untouched.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn retry(&self, task_id: &str) -> Result<Task> {
        let _guard = self.locks.lock(&task_key(task_id)).await;

        let prior = self.state.get_task(task_id).await?;
        if prior.status != TaskStatus::Failed {
            return Err(StratoError::InvalidState {
                reason: format!("task {} is {}, only failed tasks can be retried", task_id, prior.status),
            });
        }

        let now = Utc::now();
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            kind: prior.kind.clone(),
            status: TaskStatus::Pending,
            target: prior.target.clone(),
            parameters: prior.parameters.clone(),
            attempt_count: prior.attempt_count + 1,
            result: None,
            error: None,
            retry_of: Some(prior.task_id.clone()),
            created_at: now,
            updated_at: now,
        };
        self.state.insert_task(&task).await?;

        self.timeline
            .append(
                EventType::TaskRetried,
                EventSubjects::default(),
                format!("task {} retried as {} (attempt {})", prior.task_id, task.task_id, task.attempt_count),
            )
            .await?;

        info!(retry_of = %prior.task_id, attempt = task.attempt_count, "Task retried");
        Ok(task)
    }

    /// Get a task by ID.
    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.state.get_task(task_id).await
    }

    /// List tasks with optional kind/status filters, newest first.
    pub async fn list(
        &self,
        kind: Option<&str>,
        status: Option<TaskStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Task>> {
        self.state.list_tasks(kind, status, limit).await
    }
}
