//! VM lifecycle orchestrator.
//!
//! Validates and dispatches VM/network operations to the owning host's agent,
//! then reconciles the local inventory from the agent's responses. The agent
//! is authoritative; local records are a cache.
//!
//! Every mutating operation follows the same discipline:
//! 1. resolve the target host (`HostNotFound` if absent)
//! 2. consult the policy engine (`PolicyDenied` short-circuits, the agent
//!    call is never issued)
//! 3. validate and reserve intent under the per-entity lock
//! 4. release the lock, perform the agent call with a bounded timeout
//! 5. reacquire the lock to commit or roll back
//!
//! There is no automatic retry at this layer; retry belongs to the task
//! tracker for operations explicitly wrapped as tasks.

use crate::agent::{AgentClient, AgentHealth, CreateNetworkRequest, CreateVmRequest};
use crate::error::{Result, StratoError};
use crate::locks::{host_key, vm_key, LockMap};
use crate::policy::PolicyEngine;
use crate::registry::HostRegistry;
use crate::state::StateManager;
use crate::timeline::EventTimeline;
use crate::types::{
    EventSubjects, EventType, HostStatus, Network, PowerState, SnapshotRef, Vm, VmAction,
    VmResources,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Parameters for provisioning a VM.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub host_id: String,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub image: String,
    /// Project the VM is accounted against, recorded as the `project` label.
    pub project_id: Option<String>,
}

/// Orchestrator for VM and network lifecycle operations.
pub struct VmOrchestrator {
    state: Arc<StateManager>,
    registry: Arc<HostRegistry>,
    policy: Arc<PolicyEngine>,
    timeline: Arc<EventTimeline>,
    agent: Arc<dyn AgentClient>,
    locks: Arc<LockMap>,
}

impl VmOrchestrator {
    pub fn new(
        state: Arc<StateManager>,
        registry: Arc<HostRegistry>,
        policy: Arc<PolicyEngine>,
        timeline: Arc<EventTimeline>,
        agent: Arc<dyn AgentClient>,
        locks: Arc<LockMap>,
    ) -> Self {
        Self { state, registry, policy, timeline, agent, locks }
    }

    /// Policy gate for a mutating operation. A deny is recorded as a
    /// `policy.denied` event and short-circuits before any agent call.
    async fn authorize(
        &self,
        action: &str,
        host_id: Option<&str>,
        project_id: Option<&str>,
        vm_id: Option<&str>,
    ) -> Result<()> {
        match self.policy.check(action, host_id, project_id).await {
            Ok(()) => Ok(()),
            Err(err @ StratoError::PolicyDenied { .. }) => {
                let subjects = EventSubjects {
                    host_id: host_id.map(|s| s.to_string()),
                    project_id: project_id.map(|s| s.to_string()),
                    vm_id: vm_id.map(|s| s.to_string()),
                };
                self.timeline
                    .append(EventType::PolicyDenied, subjects, format!("{} rejected: {}", action, err))
                    .await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Enforce a project's quota for an additional resource request.
    ///
    /// Usage is computed from non-orphaned VM records carrying the project
    /// label; a quota axis of zero is uncapped. `exclude_vm` discounts the
    /// VM being resized.
    async fn check_quota(
        &self,
        project_id: &str,
        add_cpu: u32,
        add_memory: u64,
        add_vms: u32,
        exclude_vm: Option<&str>,
    ) -> Result<()> {
        let project = self.state.get_project(project_id).await?;
        let quota = project.quota;
        if quota.cpu_cores == 0 && quota.memory_mb == 0 && quota.vm_limit == 0 {
            return Ok(());
        }

        let mut used_cpu: u32 = 0;
        let mut used_memory: u64 = 0;
        let mut used_vms: u32 = 0;
        for vm in self.state.list_all_vms().await? {
            if vm.orphaned || vm.project_id() != Some(project_id) {
                continue;
            }
            if exclude_vm == Some(vm.vm_id.as_str()) {
                continue;
            }
            used_cpu += vm.resources.cpu_cores;
            used_memory += vm.resources.memory_mb;
            used_vms += 1;
        }

        if quota.vm_limit > 0 && used_vms + add_vms > quota.vm_limit {
            return Err(StratoError::QuotaExceeded {
                reason: format!("project {} VM limit {} reached", project_id, quota.vm_limit),
            });
        }
        if quota.cpu_cores > 0 && used_cpu + add_cpu > quota.cpu_cores {
            return Err(StratoError::QuotaExceeded {
                reason: format!("project {} CPU quota {} exceeded", project_id, quota.cpu_cores),
            });
        }
        if quota.memory_mb > 0 && used_memory + add_memory > quota.memory_mb {
            return Err(StratoError::QuotaExceeded {
                reason: format!("project {} memory quota {} MB exceeded", project_id, quota.memory_mb),
            });
        }
        Ok(())
    }

    // ========================
    // VM Operations
    // ========================

    /// Provision a new VM on a host.
    ///
    /// The local record is created only after the agent acknowledges; a
    /// failed dispatch leaves no trace.
    #[instrument(skip(self, req), fields(host_id = %req.host_id, name = %req.name))]
    pub async fn provision(&self, req: ProvisionRequest) -> Result<Vm> {
        let host = self.registry.get(&req.host_id).await?;
        self.authorize("vm.provision", Some(&req.host_id), req.project_id.as_deref(), None).await?;

        if let Some(ref project_id) = req.project_id {
            self.check_quota(project_id, req.cpu_cores, req.memory_mb, 1, None).await?;
        }

        let agent_vm = self
            .agent
            .create_vm(
                &host,
                &CreateVmRequest {
                    name: req.name.clone(),
                    cpu_cores: req.cpu_cores,
                    memory_mb: req.memory_mb,
                    image: req.image.clone(),
                },
            )
            .await?;

        let mut labels = HashMap::new();
        if let Some(ref project_id) = req.project_id {
            labels.insert("project".to_string(), project_id.clone());
        }

        let now = Utc::now();
        let vm = Vm {
            vm_id: agent_vm.vm_id.clone(),
            host_id: host.host_id.clone(),
            name: agent_vm.name,
            resources: VmResources { cpu_cores: agent_vm.cpu_cores, memory_mb: agent_vm.memory_mb },
            image: agent_vm.image,
            power_state: agent_vm.power_state,
            networks: agent_vm.networks,
            labels,
            annotations: HashMap::new(),
            orphaned: false,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.locks.lock(&vm_key(&vm.vm_id)).await;
        self.state.insert_vm(&vm).await?;

        metrics::counter!("strato_vms_provisioned_total").increment(1);
        self.timeline
            .append(
                EventType::VmProvisioned,
                EventSubjects::vm(&host.host_id, &vm.vm_id),
                format!("vm {} ({}) provisioned on host {}", vm.vm_id, vm.name, host.host_id),
            )
            .await?;

        info!(vm_id = %vm.vm_id, "VM provisioned");
        Ok(vm)
    }

    /// List VMs on a host, refreshed from the agent (cache-aside with the
    /// agent as source of truth).
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn list_vms(&self, host_id: &str) -> Result<Vec<Vm>> {
        let host = self.registry.get(host_id).await?;
        let agent_vms = self.agent.list_vms(&host).await?;

        let known = self.state.list_vms(host_id).await?;
        let agent_ids: Vec<&str> = agent_vms.iter().map(|v| v.vm_id.as_str()).collect();

        // Drop cached records the agent no longer reports; orphaned records
        // are kept for explicit reconciliation.
        for vm in &known {
            if !vm.orphaned && !agent_ids.contains(&vm.vm_id.as_str()) {
                let _guard = self.locks.lock(&vm_key(&vm.vm_id)).await;
                self.state.delete_vm(&vm.vm_id).await?;
                self.state.delete_vm_snapshots(&vm.vm_id).await?;
            }
        }

        // Fold the agent's view into the cache. Agent-reported fields win;
        // control-plane metadata (labels, annotations) is preserved.
        for agent_vm in agent_vms {
            let _guard = self.locks.lock(&vm_key(&agent_vm.vm_id)).await;
            match self.state.get_vm_opt(&agent_vm.vm_id).await? {
                Some(mut vm) => {
                    vm.name = agent_vm.name;
                    vm.resources =
                        VmResources { cpu_cores: agent_vm.cpu_cores, memory_mb: agent_vm.memory_mb };
                    vm.image = agent_vm.image;
                    vm.power_state = agent_vm.power_state;
                    vm.networks = agent_vm.networks;
                    vm.updated_at = Utc::now();
                    self.state.update_vm(&vm).await?;
                }
                None => {
                    let now = Utc::now();
                    self.state
                        .insert_vm(&Vm {
                            vm_id: agent_vm.vm_id.clone(),
                            host_id: host_id.to_string(),
                            name: agent_vm.name,
                            resources: VmResources {
                                cpu_cores: agent_vm.cpu_cores,
                                memory_mb: agent_vm.memory_mb,
                            },
                            image: agent_vm.image,
                            power_state: agent_vm.power_state,
                            networks: agent_vm.networks,
                            labels: HashMap::new(),
                            annotations: HashMap::new(),
                            orphaned: false,
                            created_at: now,
                            updated_at: now,
                        })
                        .await?;
                }
            }
        }

        self.state.list_vms(host_id).await
    }

    /// Get a VM from the local cache.
    pub async fn get_vm(&self, vm_id: &str) -> Result<Vm> {
        self.state.get_vm(vm_id).await
    }

    /// Probe a host's agent directly.
    ///
    /// Read-only, so no policy gate. Host liveness in the registry is driven
    /// by heartbeats independently of this probe.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn agent_health(&self, host_id: &str) -> Result<AgentHealth> {
        let host = self.registry.get(host_id).await?;
        self.agent.health(&host).await
    }

    /// Apply a power action to a VM.
    ///
    /// The transition is validated optimistically against the last-known
    /// state; the agent's reported state is committed afterwards.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id, action = %action))]
    pub async fn action(&self, vm_id: &str, host_id: &str, action: VmAction) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;

        // Validate under the VM lock, then release it for the agent call.
        let project_id = {
            let _guard = self.locks.lock(&vm_key(vm_id)).await;
            let vm = self.state.get_vm(vm_id).await?;
            action.validate(vm_id, vm.power_state)?;
            vm.project_id().map(|s| s.to_string())
        };

        self.authorize(&format!("vm.{}", action.as_str()), Some(host_id), project_id.as_deref(), Some(vm_id))
            .await?;

        let agent_vm = self.agent.vm_action(&host, vm_id, action).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        vm.power_state = agent_vm.power_state;
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        metrics::counter!("strato_vm_actions_total", "action" => action.as_str().to_string())
            .increment(1);
        self.timeline
            .append(
                EventType::VmAction,
                EventSubjects::vm(host_id, vm_id),
                format!("vm {} {} -> {}", vm_id, action, vm.power_state),
            )
            .await?;

        Ok(vm)
    }

    /// Resize a VM's CPU/memory allocation. Illegal while provisioning.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id))]
    pub async fn resize(
        &self,
        vm_id: &str,
        host_id: &str,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;

        let project_id = {
            let _guard = self.locks.lock(&vm_key(vm_id)).await;
            let vm = self.state.get_vm(vm_id).await?;
            if vm.power_state == PowerState::Provisioning {
                return Err(StratoError::InvalidState {
                    reason: format!("vm {} is provisioning and cannot be resized", vm_id),
                });
            }
            vm.project_id().map(|s| s.to_string())
        };

        self.authorize("vm.resize", Some(host_id), project_id.as_deref(), Some(vm_id)).await?;
        if let Some(ref project_id) = project_id {
            self.check_quota(project_id, cpu_cores, memory_mb, 0, Some(vm_id)).await?;
        }

        let agent_vm = self.agent.resize_vm(&host, vm_id, cpu_cores, memory_mb).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        vm.resources = VmResources { cpu_cores: agent_vm.cpu_cores, memory_mb: agent_vm.memory_mb };
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        self.timeline
            .append(
                EventType::VmResized,
                EventSubjects::vm(host_id, vm_id),
                format!("vm {} resized to {} cores / {} MB", vm_id, cpu_cores, memory_mb),
            )
            .await?;

        Ok(vm)
    }

    /// Migrate a VM between hosts.
    ///
    /// Two-phase: the record enters `provisioning` while the export/import
    /// runs, and moves to the target host only after the agents confirm. On
    /// failure the record reverts to its prior host and state, and the
    /// failure reason is recorded on the timeline.
    #[instrument(skip(self), fields(vm_id = %vm_id, source = %source_host_id, target = %target_host_id))]
    pub async fn migrate(
        &self,
        vm_id: &str,
        source_host_id: &str,
        target_host_id: &str,
    ) -> Result<Vm> {
        if source_host_id == target_host_id {
            return Err(StratoError::Conflict {
                reason: "source and target host are the same".to_string(),
            });
        }

        let source = self.registry.get(source_host_id).await?;
        let target = self.registry.get(target_host_id).await?;

        for host in [&source, &target] {
            if host.status != HostStatus::Ready || !self.registry.is_responsive(host) {
                return Err(StratoError::InvalidState {
                    reason: format!(
                        "host {} is {} ({}); migration requires ready and responsive hosts",
                        host.host_id,
                        host.status,
                        if self.registry.is_responsive(host) { "responsive" } else { "unresponsive" }
                    ),
                });
            }
        }

        // Reserve intent: ordered host locks plus the VM lock, mark the VM
        // provisioning, then release before any agent I/O.
        let source_key = host_key(source_host_id);
        let target_key = host_key(target_host_id);
        let vm_lock_key = vm_key(vm_id);
        let prior_state;
        {
            let _guards =
                self.locks.lock_many(&[&source_key, &target_key, &vm_lock_key]).await;

            let vm = self.state.get_vm(vm_id).await?;
            if vm.host_id != source_host_id {
                return Err(StratoError::Conflict {
                    reason: format!("vm {} is on host {}, not {}", vm_id, vm.host_id, source_host_id),
                });
            }
            if vm.power_state == PowerState::Provisioning {
                return Err(StratoError::InvalidState {
                    reason: format!("vm {} is already provisioning", vm_id),
                });
            }
            prior_state = vm.power_state;
            let project_id = vm.project_id().map(|s| s.to_string());

            self.authorize("vm.migrate", Some(source_host_id), project_id.as_deref(), Some(vm_id))
                .await?;

            self.state.update_vm_power_state(vm_id, PowerState::Provisioning).await?;
        }

        // Agent phase: export from source, import to target, delete source copy.
        let outcome: Result<()> = async {
            let exported = self.agent.export_vm(&source, vm_id).await?;
            self.agent.import_vm(&target, &exported).await?;
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            // Roll back the reservation: the VM stays on the source host.
            let _guard = self.locks.lock(&vm_lock_key).await;
            self.state.update_vm_power_state(vm_id, prior_state).await?;
            self.timeline
                .append(
                    EventType::VmMigrateFailed,
                    EventSubjects::vm(source_host_id, vm_id),
                    format!(
                        "migration of vm {} from {} to {} failed: {}",
                        vm_id, source_host_id, target_host_id, err
                    ),
                )
                .await?;
            metrics::counter!("strato_vm_migrations_total", "outcome" => "failed").increment(1);
            return Err(err);
        }

        // The target owns the VM now; a failed source cleanup leaves a stale
        // copy that is surfaced for operator reconciliation, not rolled back.
        let mut cleanup_note = String::new();
        if let Err(err) = self.agent.delete_vm(&source, vm_id).await {
            warn!(error = %err, "Source cleanup after migration failed");
            cleanup_note = format!("; stale copy left on source host: {}", err);
        }

        let _guard = self.locks.lock(&vm_lock_key).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        vm.host_id = target_host_id.to_string();
        vm.power_state = prior_state;
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        metrics::counter!("strato_vm_migrations_total", "outcome" => "succeeded").increment(1);
        self.timeline
            .append(
                EventType::VmMigrated,
                EventSubjects::vm(target_host_id, vm_id),
                format!(
                    "vm {} migrated from {} to {}{}",
                    vm_id, source_host_id, target_host_id, cleanup_note
                ),
            )
            .await?;

        info!("VM migrated");
        Ok(vm)
    }

    /// Clone a VM into a new one.
    ///
    /// The resource spec and metadata are deep-copied; network attachments
    /// are only carried over when `copy_attachments` is set. Snapshots are
    /// never copied (the agent contract has no snapshot transfer operation).
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id, name = %name))]
    pub async fn clone_vm(
        &self,
        vm_id: &str,
        host_id: &str,
        name: &str,
        copy_attachments: bool,
    ) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;
        let source = self.state.get_vm(vm_id).await?;
        self.authorize("vm.clone", Some(host_id), source.project_id(), Some(vm_id)).await?;

        if let Some(project_id) = source.project_id() {
            self.check_quota(project_id, source.resources.cpu_cores, source.resources.memory_mb, 1, None)
                .await?;
        }

        let agent_vm = self.agent.clone_vm(&host, vm_id, name).await?;

        let mut networks = Vec::new();
        if copy_attachments {
            for network_id in &source.networks {
                match self.agent.attach_network(&host, network_id, &agent_vm.vm_id).await {
                    Ok(()) => networks.push(network_id.clone()),
                    Err(err) => {
                        warn!(network_id = %network_id, error = %err, "Failed to copy network attachment")
                    }
                }
            }
        }

        let now = Utc::now();
        let vm = Vm {
            vm_id: agent_vm.vm_id.clone(),
            host_id: host_id.to_string(),
            name: agent_vm.name,
            resources: VmResources { cpu_cores: agent_vm.cpu_cores, memory_mb: agent_vm.memory_mb },
            image: agent_vm.image,
            power_state: agent_vm.power_state,
            networks,
            labels: source.labels.clone(),
            annotations: source.annotations.clone(),
            orphaned: false,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.locks.lock(&vm_key(&vm.vm_id)).await;
        self.state.insert_vm(&vm).await?;

        self.timeline
            .append(
                EventType::VmCloned,
                EventSubjects::vm(host_id, &vm.vm_id),
                format!("vm {} cloned from {} as {}", vm.vm_id, vm_id, name),
            )
            .await?;

        Ok(vm)
    }

    /// Delete a VM.
    ///
    /// Attached networks are detached first, best-effort: detach failures are
    /// logged but never block the deletion. The local record is removed only
    /// after the agent confirms.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id))]
    pub async fn delete(&self, vm_id: &str, host_id: &str) -> Result<()> {
        let host = self.registry.get(host_id).await?;
        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("vm.delete", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        for network_id in &vm.networks {
            if let Err(err) = self.agent.detach_network(&host, network_id, vm_id).await {
                warn!(network_id = %network_id, error = %err, "Best-effort detach before delete failed");
            }
        }

        self.agent.delete_vm(&host, vm_id).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        self.state.delete_vm(vm_id).await?;
        self.state.delete_vm_snapshots(vm_id).await?;

        metrics::counter!("strato_vms_deleted_total").increment(1);
        self.timeline
            .append(
                EventType::VmDeleted,
                EventSubjects::vm(host_id, vm_id),
                format!("vm {} deleted from host {}", vm_id, host_id),
            )
            .await?;

        Ok(())
    }

    /// Merge labels and annotations into a VM's metadata.
    ///
    /// Provided keys overwrite existing ones; an empty value removes the key;
    /// absent keys are left untouched. Metadata lives in the control plane
    /// only, so no agent call is involved.
    #[instrument(skip(self, labels, annotations), fields(vm_id = %vm_id, host_id = %host_id))]
    pub async fn set_metadata(
        &self,
        vm_id: &str,
        host_id: &str,
        labels: HashMap<String, String>,
        annotations: HashMap<String, String>,
    ) -> Result<Vm> {
        self.registry.get(host_id).await?;

        let project_id = self.state.get_vm(vm_id).await?.project_id().map(|s| s.to_string());
        self.authorize("vm.metadata", Some(host_id), project_id.as_deref(), Some(vm_id)).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;

        for (key, value) in labels {
            if value.is_empty() {
                vm.labels.remove(&key);
            } else {
                vm.labels.insert(key, value);
            }
        }
        for (key, value) in annotations {
            if value.is_empty() {
                vm.annotations.remove(&key);
            } else {
                vm.annotations.insert(key, value);
            }
        }

        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        self.timeline
            .append(
                EventType::VmMetadataUpdated,
                EventSubjects::vm(host_id, vm_id),
                format!("vm {} metadata updated", vm_id),
            )
            .await?;

        Ok(vm)
    }

    // ========================
    // Snapshot Operations
    // ========================

    /// Create a snapshot of a VM.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id, name = %name))]
    pub async fn snapshot_create(&self, vm_id: &str, host_id: &str, name: &str) -> Result<SnapshotRef> {
        let host = self.registry.get(host_id).await?;
        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("vm.snapshot", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        let agent_snapshot = self.agent.create_snapshot(&host, vm_id, name).await?;

        let snapshot = SnapshotRef {
            snapshot_id: agent_snapshot.snapshot_id,
            vm_id: vm_id.to_string(),
            name: agent_snapshot.name,
            captured_power_state: agent_snapshot.captured_power_state,
            captured_cpu_cores: agent_snapshot.captured_cpu_cores,
            captured_memory_mb: agent_snapshot.captured_memory_mb,
            created_at: agent_snapshot.created_at,
        };
        self.state.insert_snapshot(&snapshot).await?;

        self.timeline
            .append(
                EventType::VmSnapshotCreated,
                EventSubjects::vm(host_id, vm_id),
                format!("snapshot {} ({}) created for vm {}", snapshot.snapshot_id, name, vm_id),
            )
            .await?;

        Ok(snapshot)
    }

    /// List snapshots of a VM, refreshed from the agent.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id))]
    pub async fn snapshot_list(&self, vm_id: &str, host_id: &str) -> Result<Vec<SnapshotRef>> {
        let host = self.registry.get(host_id).await?;
        self.state.get_vm(vm_id).await?;

        let agent_snapshots = self.agent.list_snapshots(&host, vm_id).await?;

        self.state.delete_vm_snapshots(vm_id).await?;
        for s in agent_snapshots {
            self.state
                .insert_snapshot(&SnapshotRef {
                    snapshot_id: s.snapshot_id,
                    vm_id: vm_id.to_string(),
                    name: s.name,
                    captured_power_state: s.captured_power_state,
                    captured_cpu_cores: s.captured_cpu_cores,
                    captured_memory_mb: s.captured_memory_mb,
                    created_at: s.created_at,
                })
                .await?;
        }

        self.state.list_snapshots(vm_id).await
    }

    /// Revert a VM to a snapshot.
    ///
    /// Snapshot consistency is not guaranteed on a running VM, so the revert
    /// is only legal while the VM is stopped or paused.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id, snapshot_id = %snapshot_id))]
    pub async fn snapshot_revert(&self, vm_id: &str, host_id: &str, snapshot_id: &str) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;
        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("vm.snapshot", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        if !matches!(vm.power_state, PowerState::Stopped | PowerState::Paused) {
            return Err(StratoError::InvalidState {
                reason: format!(
                    "vm {} is {}; snapshot revert requires stopped or paused",
                    vm_id, vm.power_state
                ),
            });
        }

        if self.state.get_snapshot_opt(snapshot_id).await?.is_none() {
            return Err(StratoError::SnapshotNotFound { snapshot_id: snapshot_id.to_string() });
        }

        let agent_vm = self.agent.revert_snapshot(&host, vm_id, snapshot_id).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        vm.power_state = agent_vm.power_state;
        vm.resources = VmResources { cpu_cores: agent_vm.cpu_cores, memory_mb: agent_vm.memory_mb };
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        self.timeline
            .append(
                EventType::VmSnapshotReverted,
                EventSubjects::vm(host_id, vm_id),
                format!("vm {} reverted to snapshot {}", vm_id, snapshot_id),
            )
            .await?;

        Ok(vm)
    }

    /// Delete a snapshot.
    #[instrument(skip(self), fields(vm_id = %vm_id, host_id = %host_id, snapshot_id = %snapshot_id))]
    pub async fn snapshot_delete(&self, vm_id: &str, host_id: &str, snapshot_id: &str) -> Result<()> {
        let host = self.registry.get(host_id).await?;
        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("vm.snapshot", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        self.agent.delete_snapshot(&host, vm_id, snapshot_id).await?;
        self.state.delete_snapshot(snapshot_id).await?;

        self.timeline
            .append(
                EventType::VmSnapshotDeleted,
                EventSubjects::vm(host_id, vm_id),
                format!("snapshot {} deleted for vm {}", snapshot_id, vm_id),
            )
            .await?;

        Ok(())
    }

    // ========================
    // Network Operations
    // ========================

    /// Create a network on a host. The VLAN id, when given, must be unique
    /// within the host's network set.
    #[instrument(skip(self), fields(host_id = %host_id, name = %name))]
    pub async fn create_network(
        &self,
        host_id: &str,
        name: &str,
        cidr: &str,
        vlan_id: Option<u16>,
    ) -> Result<Network> {
        let host = self.registry.get(host_id).await?;
        self.authorize("network.create", Some(host_id), None, None).await?;

        if let Some(vlan) = vlan_id {
            if self.state.vlan_in_use(host_id, vlan).await? {
                return Err(StratoError::Conflict {
                    reason: format!("VLAN {} is already in use on host {}", vlan, host_id),
                });
            }
        }

        let agent_network = self
            .agent
            .create_network(
                &host,
                &CreateNetworkRequest { name: name.to_string(), cidr: cidr.to_string(), vlan_id },
            )
            .await?;

        let network = Network {
            network_id: agent_network.network_id,
            host_id: host_id.to_string(),
            name: agent_network.name,
            cidr: agent_network.cidr,
            vlan_id: agent_network.vlan_id,
            created_at: Utc::now(),
        };
        self.state.insert_network(&network).await?;

        self.timeline
            .append(
                EventType::NetworkCreated,
                EventSubjects::host(host_id),
                format!("network {} ({}) created on host {}", network.network_id, name, host_id),
            )
            .await?;

        Ok(network)
    }

    /// List networks on a host, refreshed from the agent.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn list_networks(&self, host_id: &str) -> Result<Vec<Network>> {
        let host = self.registry.get(host_id).await?;
        let agent_networks = self.agent.list_networks(&host).await?;

        let known = self.state.list_networks(host_id).await?;
        let agent_ids: Vec<&str> = agent_networks.iter().map(|n| n.network_id.as_str()).collect();
        for network in &known {
            if !agent_ids.contains(&network.network_id.as_str()) {
                self.state.delete_network(&network.network_id).await?;
            }
        }

        let known_ids: Vec<String> = known.iter().map(|n| n.network_id.clone()).collect();
        for agent_network in agent_networks {
            if !known_ids.contains(&agent_network.network_id) {
                self.state
                    .insert_network(&Network {
                        network_id: agent_network.network_id,
                        host_id: host_id.to_string(),
                        name: agent_network.name,
                        cidr: agent_network.cidr,
                        vlan_id: agent_network.vlan_id,
                        created_at: agent_network.created_at,
                    })
                    .await?;
            }
        }

        self.state.list_networks(host_id).await
    }

    /// Attach a network to a VM. Fails with `Conflict` if already attached.
    #[instrument(skip(self), fields(vm_id = %vm_id, network_id = %network_id, host_id = %host_id))]
    pub async fn network_attach(&self, vm_id: &str, network_id: &str, host_id: &str) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;
        let network = self.state.get_network(network_id).await?;
        if network.host_id != host_id {
            return Err(StratoError::NetworkNotFound { network_id: network_id.to_string() });
        }

        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("network.attach", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        if vm.networks.iter().any(|n| n == network_id) {
            return Err(StratoError::Conflict {
                reason: format!("network {} already attached to vm {}", network_id, vm_id),
            });
        }

        self.agent.attach_network(&host, network_id, vm_id).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        if !vm.networks.iter().any(|n| n == network_id) {
            vm.networks.push(network_id.to_string());
        }
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        self.timeline
            .append(
                EventType::NetworkAttached,
                EventSubjects::vm(host_id, vm_id),
                format!("network {} attached to vm {}", network_id, vm_id),
            )
            .await?;

        Ok(vm)
    }

    /// Detach a network from a VM. Fails with `NotFound` if not attached.
    #[instrument(skip(self), fields(vm_id = %vm_id, network_id = %network_id, host_id = %host_id))]
    pub async fn network_detach(&self, vm_id: &str, network_id: &str, host_id: &str) -> Result<Vm> {
        let host = self.registry.get(host_id).await?;
        let vm = self.state.get_vm(vm_id).await?;
        self.authorize("network.detach", Some(host_id), vm.project_id(), Some(vm_id)).await?;

        if !vm.networks.iter().any(|n| n == network_id) {
            return Err(StratoError::NetworkNotFound { network_id: network_id.to_string() });
        }

        self.agent.detach_network(&host, network_id, vm_id).await?;

        let _guard = self.locks.lock(&vm_key(vm_id)).await;
        let mut vm = self.state.get_vm(vm_id).await?;
        vm.networks.retain(|n| n != network_id);
        vm.updated_at = Utc::now();
        self.state.update_vm(&vm).await?;

        self.timeline
            .append(
                EventType::NetworkDetached,
                EventSubjects::vm(host_id, vm_id),
                format!("network {} detached from vm {}", network_id, vm_id),
            )
            .await?;

        Ok(vm)
    }

    /// Delete a network. Fails with `Conflict` while any VM still has it
    /// attached.
    #[instrument(skip(self), fields(network_id = %network_id, host_id = %host_id))]
    pub async fn delete_network(&self, network_id: &str, host_id: &str) -> Result<()> {
        let host = self.registry.get(host_id).await?;
        let network = self.state.get_network(network_id).await?;
        if network.host_id != host_id {
            return Err(StratoError::NetworkNotFound { network_id: network_id.to_string() });
        }
        self.authorize("network.delete", Some(host_id), None, None).await?;

        let attached: Vec<String> = self
            .state
            .list_vms(host_id)
            .await?
            .into_iter()
            .filter(|vm| vm.networks.iter().any(|n| n == network_id))
            .map(|vm| vm.vm_id)
            .collect();
        if !attached.is_empty() {
            return Err(StratoError::Conflict {
                reason: format!(
                    "network {} is attached to {} VM(s): {}",
                    network_id,
                    attached.len(),
                    attached.join(", ")
                ),
            });
        }

        self.agent.delete_network(&host, network_id).await?;
        self.state.delete_network(network_id).await?;

        self.timeline
            .append(
                EventType::NetworkDeleted,
                EventSubjects::host(host_id),
                format!("network {} deleted from host {}", network_id, host_id),
            )
            .await?;

        Ok(())
    }
}
