use crate::error::StratoError;
use crate::state::StateManager;
use crate::types::{
    EventFilter, EventRecord, EventSubjects, Host, HostStatus, Network, PowerState, Task,
    TaskStatus, Vm, VmResources,
};
use chrono::{Duration, Utc};

fn host(host_id: &str) -> Host {
    let now = Utc::now();
    Host {
        host_id: host_id.to_string(),
        name: format!("host-{}", host_id),
        address: "10.0.0.1".to_string(),
        status: HostStatus::Unknown,
        cpu_cores: 16,
        memory_mb: 65536,
        observed_cpu_cores: 16,
        observed_memory_mb: 65536,
        hypervisor_uri: "qemu:///system".to_string(),
        last_heartbeat_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn vm(vm_id: &str, host_id: &str) -> Vm {
    let now = Utc::now();
    Vm {
        vm_id: vm_id.to_string(),
        host_id: host_id.to_string(),
        name: format!("vm-{}", vm_id),
        resources: VmResources { cpu_cores: 2, memory_mb: 4096 },
        image: "ubuntu-24.04.qcow2".to_string(),
        power_state: PowerState::Running,
        networks: vec![],
        labels: Default::default(),
        annotations: Default::default(),
        orphaned: false,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn test_state_manager_init() {
    let manager = StateManager::new_in_memory().await.unwrap();
    // Should succeed without errors
    drop(manager);
}

#[tokio::test]
async fn test_insert_and_get_host() {
    let manager = StateManager::new_in_memory().await.unwrap();

    manager.insert_host(&host("h1")).await.unwrap();

    let retrieved = manager.get_host("h1").await.unwrap();
    assert_eq!(retrieved.host_id, "h1");
    assert_eq!(retrieved.status, HostStatus::Unknown);
    assert!(retrieved.last_heartbeat_at.is_none());

    let err = manager.get_host("missing").await.unwrap_err();
    assert!(matches!(err, StratoError::HostNotFound { .. }));
}

#[tokio::test]
async fn test_host_update_roundtrip() {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_host(&host("h1")).await.unwrap();

    let mut updated = manager.get_host("h1").await.unwrap();
    updated.status = HostStatus::Draining;
    updated.last_heartbeat_at = Some(Utc::now());
    updated.observed_cpu_cores = 8;
    manager.update_host(&updated).await.unwrap();

    let retrieved = manager.get_host("h1").await.unwrap();
    assert_eq!(retrieved.status, HostStatus::Draining);
    assert_eq!(retrieved.observed_cpu_cores, 8);
    assert!(retrieved.last_heartbeat_at.is_some());
}

#[tokio::test]
async fn test_vm_roundtrip_preserves_metadata() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let mut record = vm("v1", "h1");
    record.networks = vec!["net-a".to_string(), "net-b".to_string()];
    record.labels.insert("project".to_string(), "p1".to_string());
    record.annotations.insert("owner".to_string(), "alice".to_string());
    manager.insert_vm(&record).await.unwrap();

    let retrieved = manager.get_vm("v1").await.unwrap();
    assert_eq!(retrieved.networks, vec!["net-a", "net-b"]);
    assert_eq!(retrieved.labels.get("project").map(|s| s.as_str()), Some("p1"));
    assert_eq!(retrieved.annotations.get("owner").map(|s| s.as_str()), Some("alice"));
    assert!(!retrieved.orphaned);
}

#[tokio::test]
async fn test_live_vm_count_ignores_error_vms() {
    let manager = StateManager::new_in_memory().await.unwrap();

    manager.insert_vm(&vm("v1", "h1")).await.unwrap();
    let mut broken = vm("v2", "h1");
    broken.power_state = PowerState::Error;
    manager.insert_vm(&broken).await.unwrap();
    manager.insert_vm(&vm("v3", "h2")).await.unwrap();

    assert_eq!(manager.live_vm_count("h1").await.unwrap(), 1);
    assert_eq!(manager.live_vm_count("h2").await.unwrap(), 1);
}

#[tokio::test]
async fn test_mark_host_vms_orphaned() {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_vm(&vm("v1", "h1")).await.unwrap();
    manager.insert_vm(&vm("v2", "h1")).await.unwrap();

    let flagged = manager.mark_host_vms_orphaned("h1").await.unwrap();
    assert_eq!(flagged, 2);
    assert!(manager.get_vm("v1").await.unwrap().orphaned);
}

#[tokio::test]
async fn test_network_vlan_lookup() {
    let manager = StateManager::new_in_memory().await.unwrap();

    manager
        .insert_network(&Network {
            network_id: "n1".to_string(),
            host_id: "h1".to_string(),
            name: "prod".to_string(),
            cidr: "10.88.0.0/24".to_string(),
            vlan_id: Some(100),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(manager.vlan_in_use("h1", 100).await.unwrap());
    assert!(!manager.vlan_in_use("h1", 200).await.unwrap());
    assert!(!manager.vlan_in_use("h2", 100).await.unwrap());
}

#[tokio::test]
async fn test_task_list_newest_first() {
    let manager = StateManager::new_in_memory().await.unwrap();

    for i in 1..=3 {
        let now = Utc::now();
        manager
            .insert_task(&Task {
                task_id: format!("t{}", i),
                kind: "runbook:gc".to_string(),
                status: TaskStatus::Pending,
                target: "platform".to_string(),
                parameters: serde_json::json!({}),
                attempt_count: 1,
                result: None,
                error: None,
                retry_of: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    let tasks = manager.list_tasks(None, None, None).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].task_id, "t3");
    assert_eq!(tasks[2].task_id, "t1");
}

#[tokio::test]
async fn test_event_filters_and_pruning() {
    let manager = StateManager::new_in_memory().await.unwrap();

    let old = EventRecord {
        event_id: "e1".to_string(),
        event_type: "host.registered".to_string(),
        subjects: EventSubjects::host("h1"),
        detail: "old event".to_string(),
        occurred_at: Utc::now() - Duration::days(10),
    };
    let recent = EventRecord {
        event_id: "e2".to_string(),
        event_type: "vm.provisioned".to_string(),
        subjects: EventSubjects::vm("h1", "v1"),
        detail: "recent event".to_string(),
        occurred_at: Utc::now(),
    };
    manager.insert_event(&old).await.unwrap();
    manager.insert_event(&recent).await.unwrap();

    let all = manager.list_events(&EventFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].event_id, "e2");

    let since = manager
        .list_events(&EventFilter { since: Some(Utc::now() - Duration::days(1)), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(since.len(), 1);

    let pruned = manager.prune_events_before(Utc::now() - Duration::days(7)).await.unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(manager.list_events(&EventFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_state_persistence_across_sessions() {
    let temp_dir = tempfile::TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("strato-test-persistence.db");

    // Session 1: register inventory and drop the manager
    {
        let manager = StateManager::new(&db_path).await.unwrap();
        manager.insert_host(&host("h1")).await.unwrap();
        manager.insert_vm(&vm("v1", "h1")).await.unwrap();
    }

    // Session 2: reopen and verify everything survived
    {
        let manager = StateManager::new(&db_path).await.unwrap();

        let retrieved = manager.get_host("h1").await.unwrap();
        assert_eq!(retrieved.name, "host-h1");

        let vms = manager.list_vms("h1").await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].vm_id, "v1");
        assert_eq!(vms[0].power_state, PowerState::Running);
    }
}
