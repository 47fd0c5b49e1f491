//! Host fleet registry.
//!
//! Owns host records, their administrative status, and heartbeat-driven
//! liveness. Administrative status changes only through operator actions,
//! with one exception: the first heartbeat after registration moves a host
//! out of `unknown`. Heartbeat staleness is reported as responsiveness and
//! never rewrites the administrative status.

use crate::error::{Result, StratoError};
use crate::locks::{host_key, LockMap};
use crate::state::StateManager;
use crate::timeline::EventTimeline;
use crate::types::{EventSubjects, EventType, Host, HostAction, HostLiveness, HostStatus};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Parameters for registering a host.
#[derive(Debug, Clone)]
pub struct RegisterHostRequest {
    pub host_id: String,
    pub name: String,
    pub address: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub hypervisor_uri: String,
}

/// Registry of virtualization hosts.
pub struct HostRegistry {
    state: Arc<StateManager>,
    timeline: Arc<EventTimeline>,
    locks: Arc<LockMap>,
    heartbeat_timeout: Duration,
}

impl HostRegistry {
    pub fn new(
        state: Arc<StateManager>,
        timeline: Arc<EventTimeline>,
        locks: Arc<LockMap>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self { state, timeline, locks, heartbeat_timeout }
    }

    /// Register a host, or refresh its inventory data if it already exists.
    ///
    /// Idempotent upsert keyed by `host_id`. Re-registration updates the
    /// address, declared capacity, and hypervisor URI but preserves the
    /// administrative status.
    #[instrument(skip(self, req), fields(host_id = %req.host_id))]
    pub async fn register(&self, req: RegisterHostRequest) -> Result<Host> {
        let _guard = self.locks.lock(&host_key(&req.host_id)).await;
        let now = Utc::now();

        let (host, event_type) = match self.state.get_host_opt(&req.host_id).await? {
            Some(mut host) => {
                host.name = req.name;
                host.address = req.address;
                host.cpu_cores = req.cpu_cores;
                host.memory_mb = req.memory_mb;
                host.hypervisor_uri = req.hypervisor_uri;
                host.updated_at = now;
                self.state.update_host(&host).await?;
                (host, EventType::HostUpdated)
            }
            None => {
                let host = Host {
                    host_id: req.host_id.clone(),
                    name: req.name,
                    address: req.address,
                    status: HostStatus::Unknown,
                    cpu_cores: req.cpu_cores,
                    memory_mb: req.memory_mb,
                    observed_cpu_cores: req.cpu_cores,
                    observed_memory_mb: req.memory_mb,
                    hypervisor_uri: req.hypervisor_uri,
                    last_heartbeat_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.state.insert_host(&host).await?;
                info!("Host registered");
                (host, EventType::HostRegistered)
            }
        };

        self.timeline
            .append(
                event_type,
                EventSubjects::host(&host.host_id),
                format!("host {} ({}) at {}", host.host_id, host.name, host.address),
            )
            .await?;

        Ok(host)
    }

    /// Record a heartbeat from a host agent.
    ///
    /// Updates `last_heartbeat_at` and observed capacity. The agent's status
    /// hint is advisory: it is only applied when the current administrative
    /// status is `unknown` (i.e. on the first heartbeat after registration).
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn heartbeat(
        &self,
        host_id: &str,
        status_hint: Option<HostStatus>,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Result<Host> {
        let _guard = self.locks.lock(&host_key(host_id)).await;

        let mut host = self.state.get_host(host_id).await?;
        let now = Utc::now();
        host.last_heartbeat_at = Some(now);
        host.observed_cpu_cores = cpu_cores;
        host.observed_memory_mb = memory_mb;
        host.updated_at = now;

        if host.status == HostStatus::Unknown {
            host.status = match status_hint {
                Some(hint) if hint != HostStatus::Unknown => hint,
                _ => HostStatus::Ready,
            };
        }

        self.state.update_host(&host).await?;
        metrics::counter!("strato_heartbeats_total").increment(1);
        Ok(host)
    }

    /// Apply an administrative action to a host.
    #[instrument(skip(self), fields(host_id = %host_id, action = %action.as_str()))]
    pub async fn apply_action(&self, host_id: &str, action: HostAction) -> Result<Host> {
        let _guard = self.locks.lock(&host_key(host_id)).await;

        let mut host = self.state.get_host(host_id).await?;
        let prior = host.status;
        host.status = action.target_status();
        host.updated_at = Utc::now();
        self.state.update_host(&host).await?;

        self.timeline
            .append(
                EventType::HostStatusChanged,
                EventSubjects::host(host_id),
                format!("host {} status changed: {} -> {}", host_id, prior, host.status),
            )
            .await?;

        info!(prior = %prior, new = %host.status, "Host status changed");
        Ok(host)
    }

    /// Remove a host from the fleet.
    ///
    /// Fails with `Conflict` if the host still has VMs outside the error
    /// state, unless `force` is set. Forced removal flags the remaining VM
    /// records as orphaned for explicit reconciliation; they are never
    /// silently dropped.
    #[instrument(skip(self), fields(host_id = %host_id, force = force))]
    pub async fn remove(&self, host_id: &str, force: bool) -> Result<()> {
        let _guard = self.locks.lock(&host_key(host_id)).await;

        let host = self.state.get_host(host_id).await?;
        let live_vms = self.state.live_vm_count(host_id).await?;

        if live_vms > 0 && !force {
            return Err(StratoError::Conflict {
                reason: format!("host {} has {} live VM(s); use force to remove", host_id, live_vms),
            });
        }

        let orphaned = self.state.mark_host_vms_orphaned(host_id).await?;
        if orphaned > 0 {
            warn!(orphaned, "Forced host removal left orphaned VM records");
        }

        self.state.delete_host(host_id).await?;

        self.timeline
            .append(
                EventType::HostRemoved,
                EventSubjects::host(host_id),
                format!("host {} ({}) removed, {} VM record(s) orphaned", host_id, host.name, orphaned),
            )
            .await?;

        Ok(())
    }

    /// List all hosts, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Host>> {
        self.state.list_hosts().await
    }

    /// Get a host by ID.
    pub async fn get(&self, host_id: &str) -> Result<Host> {
        self.state.get_host(host_id).await
    }

    /// Report a host's administrative status together with heartbeat
    /// responsiveness. A host is responsive iff its last heartbeat is within
    /// the configured timeout window.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn liveness(&self, host_id: &str) -> Result<HostLiveness> {
        let host = self.state.get_host(host_id).await?;
        Ok(HostLiveness { status: host.status, responsive: self.is_responsive(&host) })
    }

    /// Responsiveness check against the heartbeat timeout window.
    pub fn is_responsive(&self, host: &Host) -> bool {
        let timeout = ChronoDuration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(45));
        match host.last_heartbeat_at {
            Some(last) => Utc::now() - last <= timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host_id: &str) -> RegisterHostRequest {
        RegisterHostRequest {
            host_id: host_id.to_string(),
            name: format!("host-{}", host_id),
            address: "10.0.0.10".to_string(),
            cpu_cores: 16,
            memory_mb: 65536,
            hypervisor_uri: "qemu:///system".to_string(),
        }
    }

    async fn registry() -> (HostRegistry, Arc<StateManager>) {
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        let timeline = Arc::new(EventTimeline::new(state.clone(), 30));
        let registry = HostRegistry::new(
            state.clone(),
            timeline,
            Arc::new(LockMap::new()),
            Duration::from_secs(45),
        );
        (registry, state)
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_preserves_status() {
        let (registry, _state) = registry().await;

        let host = registry.register(request("h1")).await.unwrap();
        assert_eq!(host.status, HostStatus::Unknown);
        assert!(host.last_heartbeat_at.is_none());

        registry.apply_action("h1", HostAction::MarkMaintenance).await.unwrap();

        // Re-registration refreshes inventory but not the administrative status
        let mut req = request("h1");
        req.address = "10.0.0.99".to_string();
        req.cpu_cores = 32;
        let host = registry.register(req).await.unwrap();
        assert_eq!(host.status, HostStatus::Maintenance);
        assert_eq!(host.address, "10.0.0.99");
        assert_eq!(host.cpu_cores, 32);
    }

    #[tokio::test]
    async fn test_first_heartbeat_moves_unknown_to_ready() {
        let (registry, _state) = registry().await;
        registry.register(request("h1")).await.unwrap();

        let host = registry.heartbeat("h1", Some(HostStatus::Ready), 16, 65536).await.unwrap();
        assert_eq!(host.status, HostStatus::Ready);
        assert!(host.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_hint_never_overrides_admin_status() {
        let (registry, _state) = registry().await;
        registry.register(request("h1")).await.unwrap();
        registry.heartbeat("h1", Some(HostStatus::Ready), 16, 65536).await.unwrap();
        registry.apply_action("h1", HostAction::MarkDraining).await.unwrap();

        let host = registry.heartbeat("h1", Some(HostStatus::Ready), 8, 32768).await.unwrap();
        assert_eq!(host.status, HostStatus::Draining);
        // Observed capacity still refreshed
        assert_eq!(host.observed_cpu_cores, 8);
        assert_eq!(host.observed_memory_mb, 32768);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unregistered_host_fails() {
        let (registry, _state) = registry().await;
        let err = registry.heartbeat("ghost", None, 1, 1024).await.unwrap_err();
        assert!(matches!(err, StratoError::HostNotFound { .. }));
    }

    #[tokio::test]
    async fn test_liveness_reflects_heartbeat_window() {
        let (registry, _state) = registry().await;
        registry.register(request("h1")).await.unwrap();

        // Never heartbeated: unresponsive
        let liveness = registry.liveness("h1").await.unwrap();
        assert!(!liveness.responsive);
        assert_eq!(liveness.status, HostStatus::Unknown);

        registry.heartbeat("h1", Some(HostStatus::Ready), 16, 65536).await.unwrap();
        let liveness = registry.liveness("h1").await.unwrap();
        assert!(liveness.responsive);
        assert_eq!(liveness.status, HostStatus::Ready);
    }

    #[tokio::test]
    async fn test_list_most_recently_updated_first() {
        let (registry, _state) = registry().await;
        registry.register(request("h1")).await.unwrap();
        registry.register(request("h2")).await.unwrap();
        registry.heartbeat("h1", None, 16, 65536).await.unwrap();

        let hosts = registry.list().await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host_id, "h1");
    }

    #[tokio::test]
    async fn test_remove_with_live_vms_requires_force() {
        use crate::types::{PowerState, Vm, VmResources};

        let (registry, state) = registry().await;
        registry.register(request("h1")).await.unwrap();

        let now = Utc::now();
        state
            .insert_vm(&Vm {
                vm_id: "v1".to_string(),
                host_id: "h1".to_string(),
                name: "web".to_string(),
                resources: VmResources { cpu_cores: 2, memory_mb: 4096 },
                image: "ubuntu-24.04.qcow2".to_string(),
                power_state: PowerState::Running,
                networks: vec![],
                labels: Default::default(),
                annotations: Default::default(),
                orphaned: false,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let err = registry.remove("h1", false).await.unwrap_err();
        assert!(matches!(err, StratoError::Conflict { .. }));

        // Forced removal succeeds and flags the VM record instead of dropping it
        registry.remove("h1", true).await.unwrap();
        assert!(state.get_host_opt("h1").await.unwrap().is_none());

        let vm = state.get_vm("v1").await.unwrap();
        assert!(vm.orphaned);
    }
}
