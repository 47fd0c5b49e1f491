//! Runbook execution.
//!
//! Runbooks are named automation procedures driven through the task tracker:
//! every execution is a Task with the full pending/running/terminal
//! lifecycle, so failures can be retried through the tracker and the history
//! stays auditable.

use std::sync::Arc;
use std::time::Duration;

use strato_core::types::{EventSubjects, EventType, PowerState, Task, VmAction};
use strato_core::{
    EventTimeline, HostAction, HostRegistry, Result, StratoError, TaskTracker, VmOrchestrator,
};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

/// Task kind prefix for runbook executions.
const RUNBOOK_PREFIX: &str = "runbook:";

/// Executes runbooks submitted through the task tracker.
pub struct RunbookExecutor {
    registry: Arc<HostRegistry>,
    orchestrator: Arc<VmOrchestrator>,
    tasks: Arc<TaskTracker>,
    timeline: Arc<EventTimeline>,
}

impl RunbookExecutor {
    pub fn new(
        registry: Arc<HostRegistry>,
        orchestrator: Arc<VmOrchestrator>,
        tasks: Arc<TaskTracker>,
        timeline: Arc<EventTimeline>,
    ) -> Self {
        Self { registry, orchestrator, tasks, timeline }
    }

    /// Submit and immediately execute a runbook.
    #[instrument(skip(self, parameters), fields(runbook = %name))]
    pub async fn execute(&self, name: &str, parameters: Value) -> Result<Task> {
        let target = parameters
            .get("vm_id")
            .or_else(|| parameters.get("host_id"))
            .and_then(|v| v.as_str())
            .unwrap_or("platform")
            .to_string();

        let task =
            self.tasks.submit(&format!("{}{}", RUNBOOK_PREFIX, name), &target, parameters).await?;
        self.run_task(task).await
    }

    /// Pick up pending runbook tasks (fresh submissions and retries) and run
    /// them. Returns the number executed.
    pub async fn run_pending(&self) -> Result<u32> {
        let pending =
            self.tasks.list(None, Some(strato_core::TaskStatus::Pending), Some(50)).await?;

        let mut executed = 0;
        for task in pending {
            if !task.kind.starts_with(RUNBOOK_PREFIX) {
                continue;
            }
            // A direct execute call can claim the task between the list and
            // the status flip; skip it.
            match self.run_task(task).await {
                Ok(_) => executed += 1,
                Err(StratoError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(executed)
    }

    /// Poll loop for the daemon.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_pending().await {
                warn!(error = %e, "Runbook poll failed");
            }
        }
    }

    async fn run_task(&self, task: Task) -> Result<Task> {
        let name = task.kind.trim_start_matches(RUNBOOK_PREFIX).to_string();
        let task = self.tasks.mark_running(&task.task_id).await?;

        let outcome = self.dispatch(&name, &task.parameters).await;

        let finished = match outcome {
            Ok(result) => {
                info!(runbook = %name, task_id = %task.task_id, "Runbook succeeded");
                self.tasks.complete(&task.task_id, result).await?
            }
            Err(err) => {
                warn!(runbook = %name, task_id = %task.task_id, error = %err, "Runbook failed");
                self.tasks.fail(&task.task_id, &err.to_string()).await?
            }
        };

        self.timeline
            .append(
                EventType::RunbookExecuted,
                EventSubjects::default(),
                format!("runbook {} executed for {} ({})", name, finished.target, finished.status),
            )
            .await?;

        Ok(finished)
    }

    async fn dispatch(&self, name: &str, parameters: &Value) -> Result<Value> {
        match name {
            "node-drain" => self.node_drain(parameters).await,
            "host-evacuate" => self.host_evacuate(parameters).await,
            "image-import" => self.image_import(parameters).await,
            _ => Err(StratoError::InvalidState { reason: format!("unknown runbook: {}", name) }),
        }
    }

    fn param<'a>(parameters: &'a Value, key: &str) -> Result<&'a str> {
        parameters.get(key).and_then(|v| v.as_str()).ok_or_else(|| StratoError::InvalidState {
            reason: format!("runbook parameter '{}' is required", key),
        })
    }

    /// Mark a host draining and stop every running VM on it.
    async fn node_drain(&self, parameters: &Value) -> Result<Value> {
        let host_id = Self::param(parameters, "host_id")?;

        self.registry.apply_action(host_id, HostAction::MarkDraining).await?;

        let mut stopped = 0;
        for vm in self.orchestrator.list_vms(host_id).await? {
            if vm.power_state == PowerState::Running {
                self.orchestrator.action(&vm.vm_id, host_id, VmAction::Stop).await?;
                stopped += 1;
            }
        }

        Ok(json!({ "host_id": host_id, "stopped_vms": stopped }))
    }

    /// Migrate every VM off a host onto a target host.
    async fn host_evacuate(&self, parameters: &Value) -> Result<Value> {
        let host_id = Self::param(parameters, "host_id")?;
        let target_host_id = Self::param(parameters, "target_host_id")?;

        let mut migrated = 0;
        for vm in self.orchestrator.list_vms(host_id).await? {
            self.orchestrator.migrate(&vm.vm_id, host_id, target_host_id).await?;
            migrated += 1;
        }

        Ok(json!({ "host_id": host_id, "target_host_id": target_host_id, "migrated_vms": migrated }))
    }

    /// Record an image import against a host's catalog.
    ///
    /// The byte-level download/checksum pipeline lives outside the control
    /// plane; this runbook validates the host and records the catalog intent.
    async fn image_import(&self, parameters: &Value) -> Result<Value> {
        let host_id = Self::param(parameters, "host_id")?;
        let name = Self::param(parameters, "name")?;
        let source_url = Self::param(parameters, "source_url")?;

        self.registry.get(host_id).await?;

        Ok(json!({ "host_id": host_id, "image": name, "source_url": source_url, "status": "imported" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_core::agent::{AgentClient, MockAgentClient};
    use strato_core::{
        Config, HostStatus, LockMap, PolicyEngine, ProvisionRequest, RegisterHostRequest,
        StateManager, TaskStatus,
    };

    struct Fixture {
        executor: RunbookExecutor,
        orchestrator: Arc<VmOrchestrator>,
        registry: Arc<HostRegistry>,
        tasks: Arc<TaskTracker>,
    }

    async fn fixture() -> Fixture {
        let config = Config::default();
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        let locks = Arc::new(LockMap::new());
        let timeline = Arc::new(EventTimeline::new(state.clone(), config.event_retention_days));
        let registry = Arc::new(HostRegistry::new(
            state.clone(),
            timeline.clone(),
            locks.clone(),
            config.heartbeat_timeout(),
        ));
        let policy = Arc::new(PolicyEngine::new(state.clone(), timeline.clone(), locks.clone()));
        let agent = Arc::new(MockAgentClient::new());
        let orchestrator = Arc::new(VmOrchestrator::new(
            state.clone(),
            registry.clone(),
            policy,
            timeline.clone(),
            agent as Arc<dyn AgentClient>,
            locks.clone(),
        ));
        let tasks = Arc::new(TaskTracker::new(state, timeline.clone(), locks));
        let executor = RunbookExecutor::new(
            registry.clone(),
            orchestrator.clone(),
            tasks.clone(),
            timeline,
        );
        Fixture { executor, orchestrator, registry, tasks }
    }

    async fn ready_host(fixture: &Fixture, host_id: &str) {
        fixture
            .registry
            .register(RegisterHostRequest {
                host_id: host_id.to_string(),
                name: format!("host-{}", host_id),
                address: "10.0.0.1".to_string(),
                cpu_cores: 16,
                memory_mb: 65536,
                hypervisor_uri: "qemu:///system".to_string(),
            })
            .await
            .unwrap();
        fixture.registry.heartbeat(host_id, Some(HostStatus::Ready), 16, 65536).await.unwrap();
    }

    #[tokio::test]
    async fn test_node_drain_stops_running_vms() {
        let fixture = fixture().await;
        ready_host(&fixture, "h1").await;

        for name in ["v1", "v2"] {
            fixture
                .orchestrator
                .provision(ProvisionRequest {
                    host_id: "h1".to_string(),
                    name: name.to_string(),
                    cpu_cores: 2,
                    memory_mb: 4096,
                    image: "ubuntu-24.04.qcow2".to_string(),
                    project_id: None,
                })
                .await
                .unwrap();
        }

        let task =
            fixture.executor.execute("node-drain", json!({ "host_id": "h1" })).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.as_ref().unwrap()["stopped_vms"], 2);

        let host = fixture.registry.get("h1").await.unwrap();
        assert_eq!(host.status.as_str(), "draining");

        for vm in fixture.orchestrator.list_vms("h1").await.unwrap() {
            assert_eq!(vm.power_state, PowerState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_unknown_runbook_fails_and_is_retryable() {
        let fixture = fixture().await;

        let task = fixture.executor.execute("definitely-not-real", json!({})).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap_or("").contains("unknown runbook"));

        // Retry creates a fresh pending task that run_pending picks up
        let retried = fixture.tasks.retry(&task.task_id).await.unwrap();
        assert_eq!(retried.attempt_count, 2);

        fixture.executor.run_pending().await.unwrap();
        let after = fixture.tasks.get(&retried.task_id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_image_import_requires_registered_host() {
        let fixture = fixture().await;

        let task = fixture
            .executor
            .execute(
                "image-import",
                json!({ "host_id": "ghost", "name": "ubuntu", "source_url": "https://example.com/u.qcow2" }),
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
