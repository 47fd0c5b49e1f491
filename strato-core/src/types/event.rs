//! Event/audit timeline domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control-plane event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // Host events
    HostRegistered,
    HostUpdated,
    HostStatusChanged,
    HostRemoved,
    HostUnresponsive,

    // VM events
    VmProvisioned,
    VmAction,
    VmResized,
    VmMigrated,
    VmMigrateFailed,
    VmCloned,
    VmDeleted,
    VmMetadataUpdated,
    VmSnapshotCreated,
    VmSnapshotReverted,
    VmSnapshotDeleted,

    // Network events
    NetworkCreated,
    NetworkDeleted,
    NetworkAttached,
    NetworkDetached,

    // Policy events
    PolicyCreated,
    PolicyBound,
    PolicyDenied,

    // Task events
    TaskSubmitted,
    TaskRetried,
    RunbookExecuted,

    // Project events
    ProjectCreated,
    ProjectQuotaUpdated,
    ProjectMemberAdded,
}

impl EventType {
    /// Get the event type string (e.g. "host.status_changed").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HostRegistered => "host.registered",
            EventType::HostUpdated => "host.updated",
            EventType::HostStatusChanged => "host.status_changed",
            EventType::HostRemoved => "host.removed",
            EventType::HostUnresponsive => "host.unresponsive",
            EventType::VmProvisioned => "vm.provisioned",
            EventType::VmAction => "vm.action",
            EventType::VmResized => "vm.resized",
            EventType::VmMigrated => "vm.migrated",
            EventType::VmMigrateFailed => "vm.migrate_failed",
            EventType::VmCloned => "vm.cloned",
            EventType::VmDeleted => "vm.deleted",
            EventType::VmMetadataUpdated => "vm.metadata_updated",
            EventType::VmSnapshotCreated => "vm.snapshot_created",
            EventType::VmSnapshotReverted => "vm.snapshot_reverted",
            EventType::VmSnapshotDeleted => "vm.snapshot_deleted",
            EventType::NetworkCreated => "network.created",
            EventType::NetworkDeleted => "network.deleted",
            EventType::NetworkAttached => "network.attached",
            EventType::NetworkDetached => "network.detached",
            EventType::PolicyCreated => "policy.created",
            EventType::PolicyBound => "policy.bound",
            EventType::PolicyDenied => "policy.denied",
            EventType::TaskSubmitted => "task.submitted",
            EventType::TaskRetried => "task.retried",
            EventType::RunbookExecuted => "runbook.executed",
            EventType::ProjectCreated => "project.created",
            EventType::ProjectQuotaUpdated => "project.quota_updated",
            EventType::ProjectMemberAdded => "project.member_added",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entity references an event applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSubjects {
    pub host_id: Option<String>,
    pub project_id: Option<String>,
    pub vm_id: Option<String>,
}

impl EventSubjects {
    pub fn host(host_id: &str) -> Self {
        Self { host_id: Some(host_id.to_string()), ..Default::default() }
    }

    pub fn vm(host_id: &str, vm_id: &str) -> Self {
        Self {
            host_id: Some(host_id.to_string()),
            vm_id: Some(vm_id.to_string()),
            ..Default::default()
        }
    }

    pub fn project(project_id: &str) -> Self {
        Self { project_id: Some(project_id.to_string()), ..Default::default() }
    }
}

/// A persisted control-plane event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    /// Event type string (e.g. "vm.provisioned")
    pub event_type: String,
    pub subjects: EventSubjects,
    /// Human-readable detail
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

/// Query filter for the event timeline.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact event type string
    pub event_type: Option<String>,
    /// Only events at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Any event whose host/project/vm subject equals this id
    pub subject: Option<String>,
    /// Maximum number of events returned (newest first)
    pub limit: Option<u32>,
}
