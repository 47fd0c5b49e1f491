//! In-memory agent backend.
//!
//! Simulates a fleet of host agents without any hypervisor. State mirrors
//! what a real agent would hold: VMs, networks, and snapshots keyed per host.
//! Used by the test suite and by `mock` agent mode for local development.

use crate::agent::{
    AgentClient, AgentHealth, AgentNetwork, AgentSnapshot, AgentVm, CreateNetworkRequest,
    CreateVmRequest,
};
use crate::error::{Result, StratoError};
use crate::types::{Host, PowerState, VmAction};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MockHostState {
    vms: HashMap<String, AgentVm>,
    networks: HashMap<String, AgentNetwork>,
    snapshots: HashMap<String, HashMap<String, AgentSnapshot>>,
}

/// Mock agent client with per-host in-memory state.
#[derive(Default)]
pub struct MockAgentClient {
    hosts: Mutex<HashMap<String, MockHostState>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a host agent that cannot be reached over the network.
    pub async fn set_unreachable(&self, host_id: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(host_id.to_string());
        } else {
            set.remove(host_id);
        }
    }

    async fn check_reachable(&self, host: &Host) -> Result<()> {
        if self.unreachable.lock().await.contains(&host.host_id) {
            return Err(StratoError::AgentUnreachable {
                host_id: host.host_id.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn vm_not_found(vm_id: &str) -> StratoError {
        StratoError::AgentError { code: "not_found".to_string(), message: format!("vm {} not found", vm_id) }
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    async fn health(&self, host: &Host) -> Result<AgentHealth> {
        self.check_reachable(host).await?;
        Ok(AgentHealth { alive: true, host_id: host.host_id.clone() })
    }

    async fn list_vms(&self, host: &Host) -> Result<Vec<AgentVm>> {
        self.check_reachable(host).await?;
        let hosts = self.hosts.lock().await;
        Ok(hosts.get(&host.host_id).map(|h| h.vms.values().cloned().collect()).unwrap_or_default())
    }

    async fn create_vm(&self, host: &Host, req: &CreateVmRequest) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let vm = AgentVm {
            vm_id: Uuid::new_v4().to_string(),
            name: req.name.clone(),
            cpu_cores: req.cpu_cores,
            memory_mb: req.memory_mb,
            image: req.image.clone(),
            power_state: PowerState::Running,
            networks: Vec::new(),
            created_at: Utc::now(),
        };

        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        state.snapshots.insert(vm.vm_id.clone(), HashMap::new());
        state.vms.insert(vm.vm_id.clone(), vm.clone());
        Ok(vm)
    }

    async fn vm_action(&self, host: &Host, vm_id: &str, action: VmAction) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let vm = state.vms.get_mut(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;

        // The agent applies actions unconditionally; transition legality is
        // the orchestrator's concern.
        vm.power_state = match action {
            VmAction::Start | VmAction::Reboot | VmAction::Resume => PowerState::Running,
            VmAction::Stop => PowerState::Stopped,
            VmAction::Pause => PowerState::Paused,
        };
        Ok(vm.clone())
    }

    async fn resize_vm(
        &self,
        host: &Host,
        vm_id: &str,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let vm = state.vms.get_mut(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        vm.cpu_cores = cpu_cores;
        vm.memory_mb = memory_mb;
        Ok(vm.clone())
    }

    async fn delete_vm(&self, host: &Host, vm_id: &str) -> Result<()> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        state.vms.remove(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        state.snapshots.remove(vm_id);
        Ok(())
    }

    async fn clone_vm(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let source = state.vms.get(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;

        // Copies the resource spec; network and snapshot attachments stay behind.
        let clone = AgentVm {
            vm_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            cpu_cores: source.cpu_cores,
            memory_mb: source.memory_mb,
            image: source.image.clone(),
            power_state: PowerState::Stopped,
            networks: Vec::new(),
            created_at: Utc::now(),
        };
        state.snapshots.insert(clone.vm_id.clone(), HashMap::new());
        state.vms.insert(clone.vm_id.clone(), clone.clone());
        Ok(clone)
    }

    async fn export_vm(&self, host: &Host, vm_id: &str) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let hosts = self.hosts.lock().await;
        hosts
            .get(&host.host_id)
            .and_then(|h| h.vms.get(vm_id))
            .cloned()
            .ok_or_else(|| Self::vm_not_found(vm_id))
    }

    async fn import_vm(&self, host: &Host, vm: &AgentVm) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        if state.vms.contains_key(&vm.vm_id) {
            return Err(StratoError::AgentError {
                code: "conflict".to_string(),
                message: format!("vm {} already exists", vm.vm_id),
            });
        }
        state.snapshots.entry(vm.vm_id.clone()).or_default();
        state.vms.insert(vm.vm_id.clone(), vm.clone());
        Ok(vm.clone())
    }

    async fn create_snapshot(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentSnapshot> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let vm = state.vms.get(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;

        let snapshot = AgentSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            vm_id: vm_id.to_string(),
            name: name.to_string(),
            captured_power_state: vm.power_state,
            captured_cpu_cores: vm.cpu_cores,
            captured_memory_mb: vm.memory_mb,
            created_at: Utc::now(),
        };
        state
            .snapshots
            .entry(vm_id.to_string())
            .or_default()
            .insert(snapshot.snapshot_id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(&self, host: &Host, vm_id: &str) -> Result<Vec<AgentSnapshot>> {
        self.check_reachable(host).await?;
        let hosts = self.hosts.lock().await;
        let state = hosts.get(&host.host_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        if !state.vms.contains_key(vm_id) {
            return Err(Self::vm_not_found(vm_id));
        }
        Ok(state.snapshots.get(vm_id).map(|s| s.values().cloned().collect()).unwrap_or_default())
    }

    async fn revert_snapshot(
        &self,
        host: &Host,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<AgentVm> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();

        let snapshot = state
            .snapshots
            .get(vm_id)
            .and_then(|s| s.get(snapshot_id))
            .cloned()
            .ok_or_else(|| StratoError::AgentError {
                code: "not_found".to_string(),
                message: format!("snapshot {} not found", snapshot_id),
            })?;

        let vm = state.vms.get_mut(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        vm.power_state = snapshot.captured_power_state;
        vm.cpu_cores = snapshot.captured_cpu_cores;
        vm.memory_mb = snapshot.captured_memory_mb;
        Ok(vm.clone())
    }

    async fn delete_snapshot(&self, host: &Host, vm_id: &str, snapshot_id: &str) -> Result<()> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let removed =
            state.snapshots.get_mut(vm_id).and_then(|s| s.remove(snapshot_id)).is_some();
        if !removed {
            return Err(StratoError::AgentError {
                code: "not_found".to_string(),
                message: format!("snapshot {} not found", snapshot_id),
            });
        }
        Ok(())
    }

    async fn create_network(
        &self,
        host: &Host,
        req: &CreateNetworkRequest,
    ) -> Result<AgentNetwork> {
        self.check_reachable(host).await?;
        let network = AgentNetwork {
            network_id: Uuid::new_v4().to_string(),
            name: req.name.clone(),
            cidr: req.cidr.clone(),
            vlan_id: req.vlan_id,
            created_at: Utc::now(),
        };

        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        state.networks.insert(network.network_id.clone(), network.clone());
        Ok(network)
    }

    async fn list_networks(&self, host: &Host) -> Result<Vec<AgentNetwork>> {
        self.check_reachable(host).await?;
        let hosts = self.hosts.lock().await;
        Ok(hosts
            .get(&host.host_id)
            .map(|h| h.networks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn attach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        if !state.networks.contains_key(network_id) {
            return Err(StratoError::AgentError {
                code: "not_found".to_string(),
                message: format!("network {} not found", network_id),
            });
        }
        let vm = state.vms.get_mut(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        if !vm.networks.iter().any(|n| n == network_id) {
            vm.networks.push(network_id.to_string());
        }
        Ok(())
    }

    async fn detach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        let vm = state.vms.get_mut(vm_id).ok_or_else(|| Self::vm_not_found(vm_id))?;
        vm.networks.retain(|n| n != network_id);
        Ok(())
    }

    async fn delete_network(&self, host: &Host, network_id: &str) -> Result<()> {
        self.check_reachable(host).await?;
        let mut hosts = self.hosts.lock().await;
        let state = hosts.entry(host.host_id.clone()).or_default();
        if state.networks.remove(network_id).is_none() {
            return Err(StratoError::AgentError {
                code: "not_found".to_string(),
                message: format!("network {} not found", network_id),
            });
        }
        for vm in state.vms.values_mut() {
            vm.networks.retain(|n| n != network_id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
