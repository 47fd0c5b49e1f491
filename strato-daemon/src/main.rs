use std::sync::Arc;
use std::time::Duration;

use strato_core::agent::AgentFactory;
use strato_core::{
    init_observability, Config, EventTimeline, HealthChecker, HostRegistry, LockMap, PolicyEngine,
    StateManager, TaskTracker, VmOrchestrator,
};
use tracing::info;

mod monitor;
mod runbooks;
mod shutdown;

/// Poll interval for pending runbook tasks.
const RUNBOOK_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval for the event retention sweep.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize observability FIRST
    init_observability()?;

    info!("STRATO daemon starting");

    let config = Config::load()?;

    let health = HealthChecker::new();

    info!("Initializing state manager at {}", config.db_path);
    let state = Arc::new(StateManager::new(&config.db_path).await?);
    health.register("database").await;

    info!("Initializing agent client");
    let agent = AgentFactory::create(&config)?;
    info!(backend = agent.name(), "Agent client initialized");
    health.register("agent").await;
    health.register("fleet").await;

    // Wire up the control-plane services around shared entity locks
    let locks = Arc::new(LockMap::new());
    let timeline = Arc::new(EventTimeline::new(state.clone(), config.event_retention_days));
    let registry = Arc::new(HostRegistry::new(
        state.clone(),
        timeline.clone(),
        locks.clone(),
        config.heartbeat_timeout(),
    ));
    let policy = Arc::new(PolicyEngine::new(state.clone(), timeline.clone(), locks.clone()));
    let orchestrator = Arc::new(VmOrchestrator::new(
        state.clone(),
        registry.clone(),
        policy.clone(),
        timeline.clone(),
        agent.clone(),
        locks.clone(),
    ));
    let tasks = Arc::new(TaskTracker::new(state.clone(), timeline.clone(), locks.clone()));

    // Background loops: liveness monitor, retention sweep, runbook executor
    let fleet_monitor =
        monitor::FleetMonitor::new(registry.clone(), timeline.clone(), health.clone());
    let monitor_handle = tokio::spawn(fleet_monitor.run(config.heartbeat_timeout()));

    let retention_handle =
        tokio::spawn(monitor::retention_sweep(timeline.clone(), RETENTION_SWEEP_INTERVAL));

    let executor = Arc::new(runbooks::RunbookExecutor::new(
        registry.clone(),
        orchestrator.clone(),
        tasks.clone(),
        timeline.clone(),
    ));
    let runbook_handle = tokio::spawn(executor.run(RUNBOOK_POLL_INTERVAL));

    info!("STRATO daemon ready");

    shutdown::wait_for_signal().await;
    info!("Received shutdown signal");

    monitor_handle.abort();
    retention_handle.abort();
    runbook_handle.abort();
    let _ = monitor_handle.await;
    let _ = retention_handle.await;
    let _ = runbook_handle.await;

    info!("STRATO daemon shutting down");
    Ok(())
}
