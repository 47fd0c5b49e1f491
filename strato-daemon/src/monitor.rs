//! Background fleet monitoring.
//!
//! Two periodic sweeps:
//! - liveness: watches heartbeat recency and records a `host.unresponsive`
//!   event when a host crosses the timeout window. Administrative status is
//!   never rewritten; staleness is reported, not acted on.
//! - retention: prunes timeline events older than the configured window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strato_core::observability::health::HealthState;
use strato_core::observability::metrics::{set_host_count, set_unresponsive_hosts};
use strato_core::types::{EventSubjects, EventType, HostStatus};
use strato_core::{EventTimeline, HealthChecker, HostRegistry};
use tracing::{info, instrument, warn};

/// Periodic fleet liveness monitor.
pub struct FleetMonitor {
    registry: Arc<HostRegistry>,
    timeline: Arc<EventTimeline>,
    health: HealthChecker,
    /// Responsiveness observed on the previous sweep, per host.
    last_responsive: HashMap<String, bool>,
}

impl FleetMonitor {
    pub fn new(
        registry: Arc<HostRegistry>,
        timeline: Arc<EventTimeline>,
        health: HealthChecker,
    ) -> Self {
        Self { registry, timeline, health, last_responsive: HashMap::new() }
    }

    /// Run the monitor until the task is aborted.
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Fleet liveness sweep failed");
            }
        }
    }

    /// One liveness pass over the fleet.
    #[instrument(skip(self))]
    pub async fn sweep(&mut self) -> strato_core::Result<()> {
        let hosts = self.registry.list().await?;

        let mut unresponsive = 0i64;
        let mut by_status: HashMap<&'static str, i64> = HashMap::new();

        for host in &hosts {
            *by_status.entry(host.status.as_str()).or_insert(0) += 1;

            let responsive = self.registry.is_responsive(host);
            if !responsive {
                unresponsive += 1;
            }

            let was_responsive =
                self.last_responsive.insert(host.host_id.clone(), responsive).unwrap_or(responsive);

            if was_responsive && !responsive {
                warn!(host_id = %host.host_id, "Host missed its heartbeat window");
                self.timeline
                    .append(
                        EventType::HostUnresponsive,
                        EventSubjects::host(&host.host_id),
                        format!(
                            "host {} has not heartbeated within the timeout window (status {})",
                            host.host_id, host.status
                        ),
                    )
                    .await?;
            }
        }

        self.last_responsive.retain(|host_id, _| hosts.iter().any(|h| &h.host_id == host_id));

        for status in
            [HostStatus::Ready, HostStatus::Maintenance, HostStatus::Draining, HostStatus::Disabled, HostStatus::Unknown]
        {
            set_host_count(status.as_str(), by_status.get(status.as_str()).copied().unwrap_or(0));
        }
        set_unresponsive_hosts(unresponsive);

        if unresponsive > 0 {
            self.health
                .report(
                    "fleet",
                    HealthState::Degraded,
                    Some(format!("{} host(s) outside the heartbeat window", unresponsive)),
                )
                .await;
        } else {
            self.health.report("fleet", HealthState::Ok, None).await;
        }

        Ok(())
    }
}

/// Periodic event retention sweep. Pruning never happens on the append path.
pub async fn retention_sweep(timeline: Arc<EventTimeline>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match timeline.prune_expired().await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "Retention sweep pruned expired events"),
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }
}
