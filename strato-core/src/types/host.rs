//! Host domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A virtualization host tracked by the fleet registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Unique host identifier (chosen by the agent, typically the hostname)
    pub host_id: String,

    /// Human-readable name
    pub name: String,

    /// Management address the agent listens on
    pub address: String,

    /// Administrative status
    pub status: HostStatus,

    /// Declared capacity at registration time
    pub cpu_cores: u32,
    pub memory_mb: u64,

    /// Capacity observed in the most recent heartbeat
    pub observed_cpu_cores: u32,
    pub observed_memory_mb: u64,

    /// Hypervisor connection descriptor (e.g. a libvirt URI)
    pub hypervisor_uri: String,

    /// None until the first heartbeat arrives
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrative host status.
///
/// Changed only by explicit operator action, except for the `unknown -> ready`
/// transition on the first heartbeat after registration. Heartbeat staleness is
/// reported separately as responsiveness and never rewrites this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Ready,
    Maintenance,
    Draining,
    Disabled,
    Unknown,
}

impl HostStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ready" => HostStatus::Ready,
            "maintenance" => HostStatus::Maintenance,
            "draining" => HostStatus::Draining,
            "disabled" => HostStatus::Disabled,
            _ => HostStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Ready => "ready",
            HostStatus::Maintenance => "maintenance",
            HostStatus::Draining => "draining",
            HostStatus::Disabled => "disabled",
            HostStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative action applied to a host.
///
/// Action names arriving over the wire are rejected at the boundary if they do
/// not map to one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    MarkReady,
    MarkMaintenance,
    MarkDraining,
    Disable,
}

impl HostAction {
    /// Parse an action name. Unknown names yield `None` so callers can reject
    /// them with a typed error before they reach the state machine.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mark_ready" => Some(HostAction::MarkReady),
            "mark_maintenance" => Some(HostAction::MarkMaintenance),
            "mark_draining" => Some(HostAction::MarkDraining),
            "disable" => Some(HostAction::Disable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostAction::MarkReady => "mark_ready",
            HostAction::MarkMaintenance => "mark_maintenance",
            HostAction::MarkDraining => "mark_draining",
            HostAction::Disable => "disable",
        }
    }

    /// The administrative status this action sets.
    pub fn target_status(&self) -> HostStatus {
        match self {
            HostAction::MarkReady => HostStatus::Ready,
            HostAction::MarkMaintenance => HostStatus::Maintenance,
            HostAction::MarkDraining => HostStatus::Draining,
            HostAction::Disable => HostStatus::Disabled,
        }
    }
}

/// Combined administrative status and heartbeat responsiveness for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLiveness {
    pub status: HostStatus,
    pub responsive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_action_parse() {
        assert_eq!(HostAction::parse("mark_ready"), Some(HostAction::MarkReady));
        assert_eq!(HostAction::parse("disable"), Some(HostAction::Disable));
        assert_eq!(HostAction::parse("explode"), None);
    }

    #[test]
    fn test_host_action_target_status() {
        assert_eq!(HostAction::MarkMaintenance.target_status(), HostStatus::Maintenance);
        assert_eq!(HostAction::MarkDraining.target_status(), HostStatus::Draining);
    }

    #[test]
    fn test_host_status_roundtrip() {
        for status in
            [HostStatus::Ready, HostStatus::Maintenance, HostStatus::Draining, HostStatus::Disabled]
        {
            assert_eq!(HostStatus::parse(status.as_str()), status);
        }
        assert_eq!(HostStatus::parse("registered"), HostStatus::Unknown);
    }
}
