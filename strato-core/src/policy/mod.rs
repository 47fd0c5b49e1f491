//! Policy resolution engine.
//!
//! Policies are named rule maps bound to hosts or projects. The effective
//! policy for a (host, project) pair merges every matching binding with a
//! fixed precedence: host-scoped values override project-scoped values per
//! key, and within a scope the most recently created binding wins.
//!
//! The orchestrator consults `check` before dispatching any mutating
//! VM/network operation; a deny short-circuits the operation and the agent
//! call is never issued.

use crate::error::{Result, StratoError};
use crate::locks::{LockMap, POLICY_BINDINGS_KEY};
use crate::state::StateManager;
use crate::timeline::EventTimeline;
use crate::types::{
    EffectivePolicy, EventSubjects, EventType, Policy, PolicyBinding, PolicyTargetKind,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Policy engine: definitions, bindings, and effective-policy resolution.
pub struct PolicyEngine {
    state: Arc<StateManager>,
    timeline: Arc<EventTimeline>,
    locks: Arc<LockMap>,
}

impl PolicyEngine {
    pub fn new(state: Arc<StateManager>, timeline: Arc<EventTimeline>, locks: Arc<LockMap>) -> Self {
        Self { state, timeline, locks }
    }

    /// Create a new policy. Policies are append-only in this phase.
    #[instrument(skip(self, rules), fields(name = %name))]
    pub async fn create_policy(
        &self,
        name: &str,
        category: &str,
        rules: BTreeMap<String, String>,
    ) -> Result<Policy> {
        let policy = Policy {
            policy_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            category: category.to_string(),
            rules,
            created_at: Utc::now(),
        };
        self.state.insert_policy(&policy).await?;

        self.timeline
            .append(
                EventType::PolicyCreated,
                EventSubjects::default(),
                format!("policy {} created", policy.name),
            )
            .await?;

        info!(policy_id = %policy.policy_id, "Policy created");
        Ok(policy)
    }

    /// List all policies.
    pub async fn list_policies(&self) -> Result<Vec<Policy>> {
        self.state.list_policies().await
    }

    /// Get a policy by ID.
    pub async fn get_policy(&self, policy_id: &str) -> Result<Policy> {
        self.state.get_policy(policy_id).await
    }

    /// Bind a policy to a host or project.
    ///
    /// At most one binding exists per (policy, kind, target) tuple; a
    /// duplicate fails with `Conflict`. The target must exist.
    #[instrument(skip(self), fields(policy_id = %policy_id, target_id = %target_id))]
    pub async fn bind(
        &self,
        policy_id: &str,
        target_kind: PolicyTargetKind,
        target_id: &str,
    ) -> Result<PolicyBinding> {
        let policy = self.state.get_policy(policy_id).await?;

        match target_kind {
            PolicyTargetKind::Host => {
                self.state.get_host(target_id).await?;
            }
            PolicyTargetKind::Project => {
                self.state.get_project(target_id).await?;
            }
        }

        let _guard = self.locks.lock(POLICY_BINDINGS_KEY).await;

        let binding = PolicyBinding {
            policy_id: policy_id.to_string(),
            target_kind,
            target_id: target_id.to_string(),
            created_at: Utc::now(),
        };
        self.state.insert_binding(&binding).await?;

        let subjects = match target_kind {
            PolicyTargetKind::Host => EventSubjects::host(target_id),
            PolicyTargetKind::Project => EventSubjects::project(target_id),
        };
        self.timeline
            .append(
                EventType::PolicyBound,
                subjects,
                format!("policy {} bound to {} {}", policy.name, target_kind.as_str(), target_id),
            )
            .await?;

        Ok(binding)
    }

    /// Compute the effective policy for a (host, project) pair.
    ///
    /// Project-scoped bindings are applied first in creation order, then
    /// host-scoped bindings, so that for any conflicting key the host value
    /// overwrites the project value and within a scope the most recently
    /// created binding wins.
    #[instrument(skip(self))]
    pub async fn effective(
        &self,
        host_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<EffectivePolicy> {
        let mut merged = EffectivePolicy::empty();

        if let Some(project_id) = project_id {
            self.apply_bindings(PolicyTargetKind::Project, project_id, &mut merged).await?;
        }
        if let Some(host_id) = host_id {
            self.apply_bindings(PolicyTargetKind::Host, host_id, &mut merged).await?;
        }

        Ok(merged)
    }

    async fn apply_bindings(
        &self,
        kind: PolicyTargetKind,
        target_id: &str,
        merged: &mut EffectivePolicy,
    ) -> Result<()> {
        // Oldest first: later bindings overwrite earlier ones per key.
        let bindings = self.state.list_bindings_for(kind, target_id).await?;
        for binding in bindings {
            let policy = self.state.get_policy(&binding.policy_id).await?;
            for (key, value) in policy.rules {
                merged.rules.insert(key, value);
            }
            merged.policy_ids.push(binding.policy_id);
        }
        Ok(())
    }

    /// Check whether an action is permitted for a (host, project) pair.
    ///
    /// Rule evaluation: an explicit `action.<name> = deny` denies; an explicit
    /// `allow` permits; otherwise a `default = deny` rule denies and anything
    /// else is allowed.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        action: &str,
        host_id: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<()> {
        let effective = self.effective(host_id, project_id).await?;

        let verdict = match effective.action_rule(action) {
            Some("deny") => Err(format!("action {} denied by policy", action)),
            Some(_) => Ok(()),
            None => {
                if effective.rules.get("default").map(|v| v.as_str()) == Some("deny") {
                    Err(format!("action {} denied by default-deny policy", action))
                } else {
                    Ok(())
                }
            }
        };

        match verdict {
            Ok(()) => Ok(()),
            Err(reason) => {
                metrics::counter!("strato_policy_denials_total", "action" => action.to_string())
                    .increment(1);
                Err(StratoError::PolicyDenied { reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Host, HostStatus, Project, Quota};

    async fn engine_with_fixtures() -> (PolicyEngine, Arc<StateManager>) {
        let state = Arc::new(StateManager::new_in_memory().await.unwrap());
        let timeline = Arc::new(EventTimeline::new(state.clone(), 30));
        let locks = Arc::new(LockMap::new());

        let now = Utc::now();
        state
            .insert_host(&Host {
                host_id: "h1".to_string(),
                name: "host-1".to_string(),
                address: "10.0.0.1".to_string(),
                status: HostStatus::Ready,
                cpu_cores: 16,
                memory_mb: 65536,
                observed_cpu_cores: 16,
                observed_memory_mb: 65536,
                hypervisor_uri: "qemu:///system".to_string(),
                last_heartbeat_at: Some(now),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        state
            .insert_project(&Project {
                project_id: "p1".to_string(),
                name: "team-a".to_string(),
                description: String::new(),
                quota: Quota::default(),
                created_at: now,
            })
            .await
            .unwrap();

        (PolicyEngine::new(state.clone(), timeline, locks), state)
    }

    fn rules(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_host_scope_overrides_project_scope() {
        let (engine, _state) = engine_with_fixtures().await;

        // Project binding created after the host binding: creation order must
        // not matter across scopes.
        let host_policy = engine
            .create_policy("host-allow", "governance", rules(&[("action.vm.provision", "allow")]))
            .await
            .unwrap();
        engine.bind(&host_policy.policy_id, PolicyTargetKind::Host, "h1").await.unwrap();

        let project_policy = engine
            .create_policy("project-deny", "governance", rules(&[("action.vm.provision", "deny")]))
            .await
            .unwrap();
        engine.bind(&project_policy.policy_id, PolicyTargetKind::Project, "p1").await.unwrap();

        let effective = engine.effective(Some("h1"), Some("p1")).await.unwrap();
        assert_eq!(effective.action_rule("vm.provision"), Some("allow"));
        assert!(engine.check("vm.provision", Some("h1"), Some("p1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_equal_scope_last_created_wins() {
        let (engine, _state) = engine_with_fixtures().await;

        let first = engine
            .create_policy("first", "governance", rules(&[("limit.cpu_cores", "4")]))
            .await
            .unwrap();
        engine.bind(&first.policy_id, PolicyTargetKind::Project, "p1").await.unwrap();

        let second = engine
            .create_policy("second", "governance", rules(&[("limit.cpu_cores", "8")]))
            .await
            .unwrap();
        engine.bind(&second.policy_id, PolicyTargetKind::Project, "p1").await.unwrap();

        let effective = engine.effective(None, Some("p1")).await.unwrap();
        assert_eq!(effective.rules.get("limit.cpu_cores").map(|s| s.as_str()), Some("8"));
        assert_eq!(effective.policy_ids, vec![first.policy_id, second.policy_id]);
    }

    #[tokio::test]
    async fn test_check_denies_bound_action() {
        let (engine, _state) = engine_with_fixtures().await;

        let policy = engine
            .create_policy("deny-provision", "governance", rules(&[("action.vm.provision", "deny")]))
            .await
            .unwrap();
        engine.bind(&policy.policy_id, PolicyTargetKind::Project, "p1").await.unwrap();

        let err = engine.check("vm.provision", None, Some("p1")).await.unwrap_err();
        assert!(matches!(err, StratoError::PolicyDenied { .. }));

        // Unrelated action stays allowed
        assert!(engine.check("vm.delete", None, Some("p1")).await.is_ok());
        // Unrelated project stays allowed
        assert!(engine.check("vm.provision", None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_default_deny() {
        let (engine, _state) = engine_with_fixtures().await;

        let policy = engine
            .create_policy(
                "lockdown",
                "governance",
                rules(&[("default", "deny"), ("action.vm.stop", "allow")]),
            )
            .await
            .unwrap();
        engine.bind(&policy.policy_id, PolicyTargetKind::Host, "h1").await.unwrap();

        assert!(engine.check("vm.provision", Some("h1"), None).await.is_err());
        assert!(engine.check("vm.stop", Some("h1"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_binding_conflicts() {
        let (engine, _state) = engine_with_fixtures().await;

        let policy = engine.create_policy("p", "governance", rules(&[])).await.unwrap();
        engine.bind(&policy.policy_id, PolicyTargetKind::Host, "h1").await.unwrap();

        let err = engine.bind(&policy.policy_id, PolicyTargetKind::Host, "h1").await.unwrap_err();
        assert!(matches!(err, StratoError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_bind_requires_existing_target() {
        let (engine, _state) = engine_with_fixtures().await;
        let policy = engine.create_policy("p", "governance", rules(&[])).await.unwrap();

        let err = engine.bind(&policy.policy_id, PolicyTargetKind::Host, "ghost").await.unwrap_err();
        assert!(matches!(err, StratoError::HostNotFound { .. }));

        let err =
            engine.bind("missing-policy", PolicyTargetKind::Host, "h1").await.unwrap_err();
        assert!(matches!(err, StratoError::PolicyNotFound { .. }));
    }
}
