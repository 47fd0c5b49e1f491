//! VM domain types and the power-state transition table.

use crate::error::{Result, StratoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A virtual machine as known to the control plane.
///
/// The host agent is authoritative for VM state; this record is a cache that
/// can go stale between heartbeats and list refreshes. Consistency-sensitive
/// operations refresh it from the agent before acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Unique VM identifier within its host (UUID v4)
    pub vm_id: String,

    /// Owning host
    pub host_id: String,

    /// Human-readable name
    pub name: String,

    /// Resource allocation
    pub resources: VmResources,

    /// Image reference the VM was provisioned from
    pub image: String,

    /// Last-known power state
    pub power_state: PowerState,

    /// Attached network ids, in attachment order, unique
    pub networks: Vec<String>,

    /// Labels (merged, never replaced wholesale)
    pub labels: HashMap<String, String>,

    /// Annotations (merged, never replaced wholesale)
    pub annotations: HashMap<String, String>,

    /// Set when the owning host was force-removed; the record is kept for
    /// operator reconciliation instead of being silently dropped.
    pub orphaned: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vm {
    /// Project this VM is accounted against, if any.
    pub fn project_id(&self) -> Option<&str> {
        self.labels.get("project").map(|s| s.as_str())
    }
}

/// VM resource allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Being created, or mid-migration
    Provisioning,
    Running,
    Stopped,
    Paused,
    /// Agent-reported failure; recoverable only via delete or a corrective action
    Error,
}

impl PowerState {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "provisioning" => PowerState::Provisioning,
            "running" => PowerState::Running,
            "stopped" => PowerState::Stopped,
            "paused" => PowerState::Paused,
            _ => PowerState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Provisioning => "provisioning",
            PowerState::Running => "running",
            PowerState::Stopped => "stopped",
            PowerState::Paused => "paused",
            PowerState::Error => "error",
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Power action applied to a VM.
///
/// A closed enumeration: unknown action strings are rejected at the boundary,
/// before they reach the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Reboot,
    Pause,
    Resume,
}

impl VmAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(VmAction::Start),
            "stop" => Some(VmAction::Stop),
            "reboot" => Some(VmAction::Reboot),
            "pause" => Some(VmAction::Pause),
            "resume" => Some(VmAction::Resume),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Reboot => "reboot",
            VmAction::Pause => "pause",
            VmAction::Resume => "resume",
        }
    }

    /// Validate this action against the last-known power state and return the
    /// state the VM lands in on success.
    ///
    /// The check is optimistic; the agent remains authoritative on conflict.
    /// `start` on a VM that already reports running is accepted as a no-op so
    /// that freshly provisioned VMs can be driven through the start flow.
    pub fn validate(&self, vm_id: &str, from: PowerState) -> Result<PowerState> {
        let next = match (self, from) {
            (VmAction::Start, PowerState::Stopped) => Some(PowerState::Running),
            (VmAction::Start, PowerState::Running) => Some(PowerState::Running),
            (VmAction::Stop, PowerState::Running) => Some(PowerState::Stopped),
            (VmAction::Reboot, PowerState::Running) => Some(PowerState::Running),
            (VmAction::Pause, PowerState::Running) => Some(PowerState::Paused),
            (VmAction::Resume, PowerState::Paused) => Some(PowerState::Running),
            _ => None,
        };

        next.ok_or_else(|| StratoError::InvalidTransition {
            vm_id: vm_id.to_string(),
            from: from.to_string(),
            action: self.as_str().to_string(),
        })
    }
}

impl std::fmt::Display for VmAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Local bookkeeping for a snapshot held by a host agent.
///
/// The captured fields mirror what the agent records at snapshot time and are
/// what a revert restores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub snapshot_id: String,
    pub vm_id: String,
    pub name: String,
    pub captured_power_state: PowerState,
    pub captured_cpu_cores: u32,
    pub captured_memory_mb: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_legal_moves() {
        assert_eq!(VmAction::Start.validate("v", PowerState::Stopped).unwrap(), PowerState::Running);
        assert_eq!(VmAction::Stop.validate("v", PowerState::Running).unwrap(), PowerState::Stopped);
        assert_eq!(VmAction::Reboot.validate("v", PowerState::Running).unwrap(), PowerState::Running);
        assert_eq!(VmAction::Pause.validate("v", PowerState::Running).unwrap(), PowerState::Paused);
        assert_eq!(VmAction::Resume.validate("v", PowerState::Paused).unwrap(), PowerState::Running);
    }

    #[test]
    fn test_start_while_paused_is_rejected() {
        let err = VmAction::Start.validate("v", PowerState::Paused).unwrap_err();
        assert!(matches!(err, StratoError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pause_only_from_running() {
        assert!(VmAction::Pause.validate("v", PowerState::Stopped).is_err());
        assert!(VmAction::Pause.validate("v", PowerState::Paused).is_err());
    }

    #[test]
    fn test_no_actions_from_provisioning_or_error() {
        for action in
            [VmAction::Start, VmAction::Stop, VmAction::Reboot, VmAction::Pause, VmAction::Resume]
        {
            assert!(action.validate("v", PowerState::Provisioning).is_err());
            assert!(action.validate("v", PowerState::Error).is_err());
        }
    }

    #[test]
    fn test_action_parse_rejects_unknown() {
        assert_eq!(VmAction::parse("start"), Some(VmAction::Start));
        assert_eq!(VmAction::parse("power_cycle"), None);
    }
}
