//! Project, membership, and quota types.
//!
//! Projects group VMs for ownership and policy resolution. Quotas cap what a
//! project may provision; zero means unlimited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource caps for a project. A value of zero leaves that axis uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub vm_limit: u32,
}

/// An ownership grouping for VMs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub quota: Quota,
    pub created_at: DateTime<Utc>,
}

/// RBAC-style membership record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMember {
    pub member_id: String,
    pub project_id: String,
    pub user_id: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}
