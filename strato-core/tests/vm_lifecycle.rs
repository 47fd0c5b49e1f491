//! Integration tests for VM lifecycle orchestration.
//!
//! These tests wire the full control plane (state, registry, policy engine,
//! timeline, orchestrator) against the mock agent backend and drive the
//! dashboard-facing operations end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strato_core::agent::{AgentClient, MockAgentClient};
use strato_core::{
    EventFilter, EventTimeline, HostAction, HostRegistry, HostStatus, LockMap, PolicyEngine,
    PowerState, ProvisionRequest, RegisterHostRequest, StateManager, StratoError, VmAction,
    VmOrchestrator,
};

struct TestPlane {
    state: Arc<StateManager>,
    registry: Arc<HostRegistry>,
    timeline: Arc<EventTimeline>,
    orchestrator: VmOrchestrator,
    agent: Arc<MockAgentClient>,
}

async fn plane() -> TestPlane {
    let state = Arc::new(StateManager::new_in_memory().await.unwrap());
    let locks = Arc::new(LockMap::new());
    let timeline = Arc::new(EventTimeline::new(state.clone(), 30));
    let registry = Arc::new(HostRegistry::new(
        state.clone(),
        timeline.clone(),
        locks.clone(),
        Duration::from_secs(45),
    ));
    let policy = Arc::new(PolicyEngine::new(state.clone(), timeline.clone(), locks.clone()));
    let agent = Arc::new(MockAgentClient::new());
    let orchestrator = VmOrchestrator::new(
        state.clone(),
        registry.clone(),
        policy,
        timeline.clone(),
        agent.clone() as Arc<dyn AgentClient>,
        locks,
    );
    TestPlane { state, registry, timeline, orchestrator, agent }
}

async fn ready_host(plane: &TestPlane, host_id: &str) {
    plane
        .registry
        .register(RegisterHostRequest {
            host_id: host_id.to_string(),
            name: format!("host-{}", host_id),
            address: format!("10.0.0.{}", host_id.len()),
            cpu_cores: 16,
            memory_mb: 65536,
            hypervisor_uri: "qemu:///system".to_string(),
        })
        .await
        .unwrap();
    plane.registry.heartbeat(host_id, Some(HostStatus::Ready), 16, 65536).await.unwrap();
}

fn provision_request(host_id: &str, name: &str) -> ProvisionRequest {
    ProvisionRequest {
        host_id: host_id.to_string(),
        name: name.to_string(),
        cpu_cores: 2,
        memory_mb: 4096,
        image: "ubuntu-24.04.qcow2".to_string(),
        project_id: None,
    }
}

#[tokio::test]
async fn test_provision_then_list_round_trip() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;

    let vm = plane.orchestrator.provision(provision_request("h1", "web-1")).await.unwrap();
    assert_eq!(vm.power_state, PowerState::Running);

    let vms = plane.orchestrator.list_vms("h1").await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].vm_id, vm.vm_id);
    assert_eq!(vms[0].resources.cpu_cores, 2);
    assert_eq!(vms[0].resources.memory_mb, 4096);
    assert_eq!(vms[0].image, "ubuntu-24.04.qcow2");
}

#[tokio::test]
async fn test_power_action_scenario() {
    // register H1 -> heartbeat ready -> provision V1 -> start -> pause ->
    // start while paused fails with InvalidTransition.
    let plane = plane().await;
    ready_host(&plane, "h1").await;

    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    let vm_after_start =
        plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Start).await.unwrap();
    assert_eq!(vm_after_start.power_state, PowerState::Running);

    let paused = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Pause).await.unwrap();
    assert_eq!(paused.power_state, PowerState::Paused);

    let err = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Start).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidTransition { .. }));

    // Illegal transitions leave the state unchanged
    let unchanged = plane.orchestrator.get_vm(&vm.vm_id).await.unwrap();
    assert_eq!(unchanged.power_state, PowerState::Paused);
}

#[tokio::test]
async fn test_start_stop_start_ends_running() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Start).await.unwrap();
    let stopped = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Stop).await.unwrap();
    assert_eq!(stopped.power_state, PowerState::Stopped);

    let running = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Start).await.unwrap();
    assert_eq!(running.power_state, PowerState::Running);

    // resume is only legal from paused
    let err = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Resume).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_action_on_unknown_host_or_vm() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;

    let err = plane.orchestrator.action("v1", "ghost", VmAction::Start).await.unwrap_err();
    assert!(matches!(err, StratoError::HostNotFound { .. }));

    let err = plane.orchestrator.action("ghost-vm", "h1", VmAction::Start).await.unwrap_err();
    assert!(matches!(err, StratoError::VmNotFound { .. }));
}

#[tokio::test]
async fn test_resize_updates_spec_and_rejects_provisioning() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    let resized = plane.orchestrator.resize(&vm.vm_id, "h1", 4, 8192).await.unwrap();
    assert_eq!(resized.resources.cpu_cores, 4);
    assert_eq!(resized.resources.memory_mb, 8192);

    plane.state.update_vm_power_state(&vm.vm_id, PowerState::Provisioning).await.unwrap();
    let err = plane.orchestrator.resize(&vm.vm_id, "h1", 8, 16384).await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidState { .. }));
}

#[tokio::test]
async fn test_agent_health_probe() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;

    let health = plane.orchestrator.agent_health("h1").await.unwrap();
    assert!(health.alive);
    assert_eq!(health.host_id, "h1");

    plane.agent.set_unreachable("h1", true).await;
    let err = plane.orchestrator.agent_health("h1").await.unwrap_err();
    assert!(matches!(err, StratoError::AgentUnreachable { .. }));
}

#[tokio::test]
async fn test_agent_unreachable_leaves_state_untouched() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    plane.agent.set_unreachable("h1", true).await;
    let err = plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Stop).await.unwrap_err();
    assert!(matches!(err, StratoError::AgentUnreachable { .. }));

    let unchanged = plane.orchestrator.get_vm(&vm.vm_id).await.unwrap();
    assert_eq!(unchanged.power_state, PowerState::Running);
}

#[tokio::test]
async fn test_metadata_merge_and_removal() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    let mut labels = HashMap::new();
    labels.insert("tier".to_string(), "web".to_string());
    labels.insert("env".to_string(), "prod".to_string());
    let vm = plane
        .orchestrator
        .set_metadata(&vm.vm_id, "h1", labels, HashMap::new())
        .await
        .unwrap();
    assert_eq!(vm.labels.len(), 2);

    // Merge: absent keys untouched, provided keys overwritten, empty removes
    let mut update = HashMap::new();
    update.insert("env".to_string(), "staging".to_string());
    update.insert("tier".to_string(), String::new());
    let mut annotations = HashMap::new();
    annotations.insert("owner".to_string(), "alice".to_string());
    let vm = plane.orchestrator.set_metadata(&vm.vm_id, "h1", update, annotations).await.unwrap();

    assert_eq!(vm.labels.get("env").map(|s| s.as_str()), Some("staging"));
    assert!(!vm.labels.contains_key("tier"));
    assert_eq!(vm.annotations.get("owner").map(|s| s.as_str()), Some("alice"));
}

#[tokio::test]
async fn test_migrate_moves_vm_between_hosts() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    ready_host(&plane, "h2").await;

    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();
    plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Stop).await.unwrap();

    let migrated = plane.orchestrator.migrate(&vm.vm_id, "h1", "h2").await.unwrap();
    assert_eq!(migrated.host_id, "h2");
    // Returns to its pre-migration state once the agents confirm
    assert_eq!(migrated.power_state, PowerState::Stopped);

    // Source agent no longer reports the VM; target does
    assert!(plane.orchestrator.list_vms("h1").await.unwrap().is_empty());
    let on_target = plane.orchestrator.list_vms("h2").await.unwrap();
    assert_eq!(on_target.len(), 1);
    assert_eq!(on_target[0].vm_id, vm.vm_id);
}

#[tokio::test]
async fn test_migrate_requires_ready_responsive_hosts() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    ready_host(&plane, "h2").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    plane.registry.apply_action("h2", HostAction::MarkMaintenance).await.unwrap();

    let err = plane.orchestrator.migrate(&vm.vm_id, "h1", "h2").await.unwrap_err();
    assert!(matches!(err, StratoError::InvalidState { .. }));

    let unchanged = plane.orchestrator.get_vm(&vm.vm_id).await.unwrap();
    assert_eq!(unchanged.host_id, "h1");
}

#[tokio::test]
async fn test_migrate_failure_reverts_and_records_event() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    ready_host(&plane, "h2").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    // Target agent down: import fails mid-flight
    plane.agent.set_unreachable("h2", true).await;
    let err = plane.orchestrator.migrate(&vm.vm_id, "h1", "h2").await.unwrap_err();
    assert!(matches!(err, StratoError::AgentUnreachable { .. }));

    // The record reverts to its prior host and state
    let reverted = plane.orchestrator.get_vm(&vm.vm_id).await.unwrap();
    assert_eq!(reverted.host_id, "h1");
    assert_eq!(reverted.power_state, PowerState::Running);

    // And the failure reason lands on the timeline
    let events = plane
        .timeline
        .list(&EventFilter { event_type: Some("vm.migrate_failed".to_string()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_clone_copies_spec_not_attachments() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    let network = plane.orchestrator.create_network("h1", "prod", "10.88.0.0/24", None).await.unwrap();
    plane.orchestrator.network_attach(&vm.vm_id, &network.network_id, "h1").await.unwrap();

    let clone = plane.orchestrator.clone_vm(&vm.vm_id, "h1", "v1-copy", false).await.unwrap();
    assert_ne!(clone.vm_id, vm.vm_id);
    assert_eq!(clone.resources, vm.resources);
    assert_eq!(clone.image, vm.image);
    assert!(clone.networks.is_empty());

    // Attachments are carried over only on explicit request
    let attached_clone = plane.orchestrator.clone_vm(&vm.vm_id, "h1", "v1-copy2", true).await.unwrap();
    assert_eq!(attached_clone.networks, vec![network.network_id.clone()]);
}

#[tokio::test]
async fn test_delete_vm_removes_record_and_snapshots() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    let network = plane.orchestrator.create_network("h1", "prod", "10.88.0.0/24", None).await.unwrap();
    plane.orchestrator.network_attach(&vm.vm_id, &network.network_id, "h1").await.unwrap();
    plane.orchestrator.snapshot_create(&vm.vm_id, "h1", "pre-delete").await.unwrap();

    plane.orchestrator.delete(&vm.vm_id, "h1").await.unwrap();

    let err = plane.orchestrator.get_vm(&vm.vm_id).await.unwrap_err();
    assert!(matches!(err, StratoError::VmNotFound { .. }));
    assert!(plane.state.list_snapshots(&vm.vm_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_revert_requires_stopped_or_paused() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Stop).await.unwrap();
    let snapshot = plane.orchestrator.snapshot_create(&vm.vm_id, "h1", "baseline").await.unwrap();
    assert_eq!(snapshot.captured_power_state, PowerState::Stopped);

    // Grow the VM, then try to revert while running
    plane.orchestrator.resize(&vm.vm_id, "h1", 8, 16384).await.unwrap();
    plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Start).await.unwrap();

    let err = plane
        .orchestrator
        .snapshot_revert(&vm.vm_id, "h1", &snapshot.snapshot_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StratoError::InvalidState { .. }));

    // Stopped again, the revert restores the captured spec
    plane.orchestrator.action(&vm.vm_id, "h1", VmAction::Stop).await.unwrap();
    let reverted =
        plane.orchestrator.snapshot_revert(&vm.vm_id, "h1", &snapshot.snapshot_id).await.unwrap();
    assert_eq!(reverted.resources.cpu_cores, 2);
    assert_eq!(reverted.resources.memory_mb, 4096);
    assert_eq!(reverted.power_state, PowerState::Stopped);
}

#[tokio::test]
async fn test_snapshot_list_refreshes_from_agent() {
    let plane = plane().await;
    ready_host(&plane, "h1").await;
    let vm = plane.orchestrator.provision(provision_request("h1", "v1")).await.unwrap();

    plane.orchestrator.snapshot_create(&vm.vm_id, "h1", "s1").await.unwrap();
    let second = plane.orchestrator.snapshot_create(&vm.vm_id, "h1", "s2").await.unwrap();

    let listed = plane.orchestrator.snapshot_list(&vm.vm_id, "h1").await.unwrap();
    assert_eq!(listed.len(), 2);

    plane.orchestrator.snapshot_delete(&vm.vm_id, "h1", &second.snapshot_id).await.unwrap();
    let listed = plane.orchestrator.snapshot_list(&vm.vm_id, "h1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "s1");
}
