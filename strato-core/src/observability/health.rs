//! Subsystem health tracking.
//!
//! The daemon registers its long-lived subsystems (database, agent client,
//! fleet monitor) at startup and reports state changes as they degrade or
//! recover. Aggregation is pessimistic: the worst subsystem state wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health state of a single subsystem or of the daemon as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
    Failed,
}

/// Point-in-time report for one subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemReport {
    pub state: HealthState,
    pub detail: Option<String>,
}

/// Aggregated daemon health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub version: &'static str,
    pub subsystems: BTreeMap<String, SubsystemReport>,
}

/// Tracks the health of the daemon's long-lived subsystems.
#[derive(Clone, Default)]
pub struct HealthChecker {
    subsystems: Arc<RwLock<BTreeMap<String, SubsystemReport>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subsystem, starting out healthy.
    pub async fn register(&self, name: &str) {
        self.subsystems
            .write()
            .await
            .insert(name.to_string(), SubsystemReport { state: HealthState::Ok, detail: None });
    }

    /// Record a subsystem's current state. Unregistered names are ignored.
    pub async fn report(&self, name: &str, state: HealthState, detail: Option<String>) {
        if let Some(entry) = self.subsystems.write().await.get_mut(name) {
            entry.state = state;
            entry.detail = detail;
        }
    }

    /// Aggregate view across all subsystems.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let subsystems = self.subsystems.read().await.clone();
        let state = subsystems.values().map(|r| r.state).max().unwrap_or(HealthState::Ok);
        HealthSnapshot { state, version: env!("CARGO_PKG_VERSION"), subsystems }
    }

    /// True while every subsystem reports `Ok`.
    pub async fn is_ready(&self) -> bool {
        self.snapshot().await.state == HealthState::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worst_subsystem_state_wins() {
        let checker = HealthChecker::new();
        checker.register("database").await;
        checker.register("fleet").await;

        assert!(checker.is_ready().await);

        checker.report("fleet", HealthState::Degraded, Some("2 hosts unresponsive".into())).await;
        let snapshot = checker.snapshot().await;
        assert_eq!(snapshot.state, HealthState::Degraded);
        assert!(!checker.is_ready().await);

        checker.report("database", HealthState::Failed, Some("pool exhausted".into())).await;
        assert_eq!(checker.snapshot().await.state, HealthState::Failed);

        checker.report("database", HealthState::Ok, None).await;
        checker.report("fleet", HealthState::Ok, None).await;
        assert!(checker.is_ready().await);
    }

    #[tokio::test]
    async fn test_unregistered_report_is_ignored() {
        let checker = HealthChecker::new();
        checker.register("database").await;

        checker.report("ghost", HealthState::Failed, None).await;
        let snapshot = checker.snapshot().await;
        assert_eq!(snapshot.state, HealthState::Ok);
        assert_eq!(snapshot.subsystems.len(), 1);
    }
}
