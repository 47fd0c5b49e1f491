//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_core_metrics() {
    // Fleet metrics
    describe_counter!("strato_heartbeats_total", "Total heartbeats received from host agents");
    describe_gauge!("strato_host_count", "Current number of hosts (by administrative status)");
    describe_gauge!(
        "strato_hosts_unresponsive",
        "Hosts whose last heartbeat is outside the timeout window"
    );

    // VM lifecycle metrics
    describe_counter!("strato_vms_provisioned_total", "Total number of VMs provisioned");
    describe_counter!("strato_vms_deleted_total", "Total number of VMs deleted");
    describe_counter!("strato_vm_actions_total", "Total VM power actions dispatched (by action)");
    describe_counter!("strato_vm_migrations_total", "Total VM migrations (by outcome)");

    // Policy metrics
    describe_counter!("strato_policy_denials_total", "Total policy denials (by action)");

    // Task metrics
    describe_counter!("strato_tasks_submitted_total", "Total tasks submitted (by kind)");
    describe_counter!("strato_tasks_completed_total", "Total tasks finished (by status)");

    // Event metrics
    describe_counter!("strato_events_total", "Total events appended (by event type)");

    // Database metrics
    describe_counter!("strato_db_errors_total", "Total database errors (by operation)");
}

/// Helper for the liveness monitor: publish host counts by status.
pub fn set_host_count(status: &str, count: i64) {
    gauge!("strato_host_count", "status" => status.to_string()).set(count as f64);
}

/// Helper for the liveness monitor: publish the unresponsive host count.
pub fn set_unresponsive_hosts(count: i64) {
    gauge!("strato_hosts_unresponsive").set(count as f64);
}
