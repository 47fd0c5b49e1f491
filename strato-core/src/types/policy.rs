//! Policy domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A declarative policy: a named, ordered rule map.
///
/// Rule keys follow a dotted convention:
/// - `action.<name>` with value `allow`/`deny` gates a control-plane action
///   (e.g. `action.vm.provision = deny`)
/// - `limit.cpu_cores` / `limit.memory_mb` cap per-VM resource requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub name: String,
    pub category: String,
    pub rules: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Scope a policy binding targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTargetKind {
    Host,
    Project,
}

impl PolicyTargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(PolicyTargetKind::Host),
            "project" => Some(PolicyTargetKind::Project),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyTargetKind::Host => "host",
            PolicyTargetKind::Project => "project",
        }
    }
}

/// Association of a policy with a host or project.
///
/// At most one binding exists per (policy, kind, target) tuple. The creation
/// order breaks ties between bindings of equal scope during resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub policy_id: String,
    pub target_kind: PolicyTargetKind,
    pub target_id: String,
    pub created_at: DateTime<Utc>,
}

/// Merged rule set for a (host, project) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    /// Merged rules after precedence: host-scoped values override
    /// project-scoped ones per key; within a scope the most recently created
    /// binding wins.
    pub rules: BTreeMap<String, String>,

    /// Policy ids that contributed, in application order.
    pub policy_ids: Vec<String>,
}

impl EffectivePolicy {
    pub fn empty() -> Self {
        Self { rules: BTreeMap::new(), policy_ids: Vec::new() }
    }

    /// Look up the verdict rule for an action name, if any.
    pub fn action_rule(&self, action: &str) -> Option<&str> {
        self.rules.get(&format!("action.{}", action)).map(|s| s.as_str())
    }
}
