//! Host agent operation client.
//!
//! Every hypervisor host runs an agent that executes VM and network
//! operations on behalf of the control plane. The orchestrator talks to
//! agents exclusively through the `AgentClient` trait:
//! - `MockAgentClient`: in-memory simulation, used by tests and `mock` mode
//! - `HttpAgentClient`: JSON over HTTP against a real host agent
//!
//! A direct-hypervisor variant can be added behind the same trait later.
//!
//! All calls are synchronous request/response with a bounded timeout. Failures
//! split into two classes the orchestrator treats differently:
//! `AgentUnreachable` (transport) and `AgentError` (agent-reported domain
//! failure, propagated verbatim).

use crate::error::Result;
use crate::types::{Host, PowerState, VmAction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod factory;
mod http;
mod mock;

pub use factory::AgentFactory;
pub use http::HttpAgentClient;
pub use mock::MockAgentClient;

/// Agent health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub alive: bool,
    pub host_id: String,
}

/// VM record as reported by a host agent. The agent is the source of truth;
/// the orchestrator folds these into its local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVm {
    pub vm_id: String,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub image: String,
    pub power_state: PowerState,
    #[serde(default)]
    pub networks: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot record as reported by a host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub snapshot_id: String,
    pub vm_id: String,
    pub name: String,
    pub captured_power_state: PowerState,
    pub captured_cpu_cores: u32,
    pub captured_memory_mb: u64,
    pub created_at: DateTime<Utc>,
}

/// Network record as reported by a host agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNetwork {
    pub network_id: String,
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub vlan_id: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a VM on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub image: String,
}

/// Parameters for creating a network on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub cidr: String,
    pub vlan_id: Option<u16>,
}

/// Capability interface for invoking operations on a remote host agent.
///
/// Implementations are addressed per call with the target `Host` so one
/// client instance serves the whole fleet.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Agent identity/health probe.
    async fn health(&self, host: &Host) -> Result<AgentHealth>;

    /// List all VMs the agent knows about.
    async fn list_vms(&self, host: &Host) -> Result<Vec<AgentVm>>;

    /// Create (and boot) a new VM.
    async fn create_vm(&self, host: &Host, req: &CreateVmRequest) -> Result<AgentVm>;

    /// Apply a power action to a VM. The agent is authoritative for the
    /// resulting state.
    async fn vm_action(&self, host: &Host, vm_id: &str, action: VmAction) -> Result<AgentVm>;

    /// Resize a VM's CPU/memory allocation.
    async fn resize_vm(
        &self,
        host: &Host,
        vm_id: &str,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Result<AgentVm>;

    /// Delete a VM.
    async fn delete_vm(&self, host: &Host, vm_id: &str) -> Result<()>;

    /// Clone a VM into a new one with a fresh id.
    async fn clone_vm(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentVm>;

    /// Export a VM definition for migration.
    async fn export_vm(&self, host: &Host, vm_id: &str) -> Result<AgentVm>;

    /// Import a previously exported VM definition.
    async fn import_vm(&self, host: &Host, vm: &AgentVm) -> Result<AgentVm>;

    /// Create a snapshot of a VM.
    async fn create_snapshot(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentSnapshot>;

    /// List snapshots of a VM.
    async fn list_snapshots(&self, host: &Host, vm_id: &str) -> Result<Vec<AgentSnapshot>>;

    /// Revert a VM to a snapshot. Returns the VM state after the revert.
    async fn revert_snapshot(&self, host: &Host, vm_id: &str, snapshot_id: &str)
        -> Result<AgentVm>;

    /// Delete a snapshot.
    async fn delete_snapshot(&self, host: &Host, vm_id: &str, snapshot_id: &str) -> Result<()>;

    /// Create a network on the host.
    async fn create_network(&self, host: &Host, req: &CreateNetworkRequest)
        -> Result<AgentNetwork>;

    /// List networks on the host.
    async fn list_networks(&self, host: &Host) -> Result<Vec<AgentNetwork>>;

    /// Attach a network to a VM.
    async fn attach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()>;

    /// Detach a network from a VM.
    async fn detach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()>;

    /// Delete a network.
    async fn delete_network(&self, host: &Host, network_id: &str) -> Result<()>;

    /// Get client name (for logging/metrics).
    fn name(&self) -> &str;
}
