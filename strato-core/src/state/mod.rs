//! State management with SQLite persistence.
//!
//! The StateManager owns all persistent inventory for the control plane:
//! - Hosts and their heartbeat/administrative state
//! - VM records cached from host agents
//! - Networks and snapshot references
//! - Policies and policy bindings
//! - Tasks and the event timeline
//! - Projects, quotas, and membership
//!
//! Per-entity write serialization is enforced above this layer by the lock
//! map; the state manager itself only guarantees row-level atomicity.

use crate::error::{Result, StratoError};
use crate::types::{
    EventFilter, EventRecord, EventSubjects, Host, HostStatus, Network, Policy, PolicyBinding,
    PolicyTargetKind, PowerState, Project, ProjectMember, Quota, SnapshotRef, Task, TaskStatus, Vm,
    VmResources,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

// Timestamps are stored as microseconds so that ordered listings (hosts by
// updated_at, events newest-first, bindings by creation) stay deterministic
// for operations landing within the same second.
fn ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

fn from_ts(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

/// State manager for persistent storage.
#[derive(Clone)]
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new StateManager with an in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new StateManager with a database at the specified path.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing state manager at {:?}", db_path);

        // Create parent directory if it doesn't exist (but not for :memory:)
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StratoError::InvalidConfig {
                        reason: format!("Failed to create directory {}: {}", parent.display(), e),
                    }
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            StratoError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        info!("State manager initialized successfully");
        Ok(manager)
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    // ========================
    // Host Operations
    // ========================

    /// Insert a new host.
    #[instrument(skip(self), fields(host_id = %host.host_id))]
    pub async fn insert_host(&self, host: &Host) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hosts (host_id, name, address, status, cpu_cores, memory_mb,
                               observed_cpu_cores, observed_memory_mb, hypervisor_uri,
                               last_heartbeat_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&host.host_id)
        .bind(&host.name)
        .bind(&host.address)
        .bind(host.status.as_str())
        .bind(host.cpu_cores as i64)
        .bind(host.memory_mb as i64)
        .bind(host.observed_cpu_cores as i64)
        .bind(host.observed_memory_mb as i64)
        .bind(&host.hypervisor_uri)
        .bind(host.last_heartbeat_at.map(ts))
        .bind(ts(host.created_at))
        .bind(ts(host.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::counter!("strato_db_errors_total", "operation" => "insert_host").increment(1);
            StratoError::DatabaseError(e.to_string())
        })?;

        Ok(())
    }

    /// Update every mutable field of a host record.
    #[instrument(skip(self), fields(host_id = %host.host_id))]
    pub async fn update_host(&self, host: &Host) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE hosts SET
                name = ?, address = ?, status = ?, cpu_cores = ?, memory_mb = ?,
                observed_cpu_cores = ?, observed_memory_mb = ?, hypervisor_uri = ?,
                last_heartbeat_at = ?, updated_at = ?
            WHERE host_id = ?
            "#,
        )
        .bind(&host.name)
        .bind(&host.address)
        .bind(host.status.as_str())
        .bind(host.cpu_cores as i64)
        .bind(host.memory_mb as i64)
        .bind(host.observed_cpu_cores as i64)
        .bind(host.observed_memory_mb as i64)
        .bind(&host.hypervisor_uri)
        .bind(host.last_heartbeat_at.map(ts))
        .bind(ts(host.updated_at))
        .bind(&host.host_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a host by ID.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn get_host(&self, host_id: &str) -> Result<Host> {
        self.get_host_opt(host_id)
            .await?
            .ok_or_else(|| StratoError::HostNotFound { host_id: host_id.to_string() })
    }

    pub async fn get_host_opt(&self, host_id: &str) -> Result<Option<Host>> {
        let row = sqlx::query("SELECT * FROM hosts WHERE host_id = ?")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                metrics::counter!("strato_db_errors_total", "operation" => "get_host").increment(1);
                StratoError::DatabaseError(e.to_string())
            })?;

        row.map(|r| self.row_to_host(r)).transpose()
    }

    /// List all hosts, most recently updated first.
    #[instrument(skip(self))]
    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query("SELECT * FROM hosts ORDER BY updated_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_host(row)).collect()
    }

    /// Delete a host record.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn delete_host(&self, host_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM hosts WHERE host_id = ?")
            .bind(host_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    fn row_to_host(&self, row: SqliteRow) -> Result<Host> {
        let status_str: String = row.get("status");
        let last_heartbeat_micros: Option<i64> = row.get("last_heartbeat_at");

        Ok(Host {
            host_id: row.get("host_id"),
            name: row.get("name"),
            address: row.get("address"),
            status: HostStatus::parse(&status_str),
            cpu_cores: row.get::<i64, _>("cpu_cores") as u32,
            memory_mb: row.get::<i64, _>("memory_mb") as u64,
            observed_cpu_cores: row.get::<i64, _>("observed_cpu_cores") as u32,
            observed_memory_mb: row.get::<i64, _>("observed_memory_mb") as u64,
            hypervisor_uri: row.get("hypervisor_uri"),
            last_heartbeat_at: last_heartbeat_micros.map(from_ts),
            created_at: from_ts(row.get("created_at")),
            updated_at: from_ts(row.get("updated_at")),
        })
    }

    // ========================
    // VM Operations
    // ========================

    /// Insert a new VM record.
    #[instrument(skip(self), fields(vm_id = %vm.vm_id))]
    pub async fn insert_vm(&self, vm: &Vm) -> Result<()> {
        let networks_json = serde_json::to_string(&vm.networks)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize networks: {}", e)))?;
        let labels_json = serde_json::to_string(&vm.labels)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize labels: {}", e)))?;
        let annotations_json = serde_json::to_string(&vm.annotations).map_err(|e| {
            StratoError::DatabaseError(format!("Failed to serialize annotations: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO vms (vm_id, host_id, name, cpu_cores, memory_mb, image, power_state,
                             networks, labels, annotations, orphaned, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.vm_id)
        .bind(&vm.host_id)
        .bind(&vm.name)
        .bind(vm.resources.cpu_cores as i64)
        .bind(vm.resources.memory_mb as i64)
        .bind(&vm.image)
        .bind(vm.power_state.as_str())
        .bind(networks_json)
        .bind(labels_json)
        .bind(annotations_json)
        .bind(vm.orphaned)
        .bind(ts(vm.created_at))
        .bind(ts(vm.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::counter!("strato_db_errors_total", "operation" => "insert_vm").increment(1);
            StratoError::DatabaseError(e.to_string())
        })?;

        Ok(())
    }

    /// Update every mutable field of a VM record.
    #[instrument(skip(self), fields(vm_id = %vm.vm_id))]
    pub async fn update_vm(&self, vm: &Vm) -> Result<()> {
        let networks_json = serde_json::to_string(&vm.networks)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize networks: {}", e)))?;
        let labels_json = serde_json::to_string(&vm.labels)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize labels: {}", e)))?;
        let annotations_json = serde_json::to_string(&vm.annotations).map_err(|e| {
            StratoError::DatabaseError(format!("Failed to serialize annotations: {}", e))
        })?;

        sqlx::query(
            r#"
            UPDATE vms SET
                host_id = ?, name = ?, cpu_cores = ?, memory_mb = ?, image = ?, power_state = ?,
                networks = ?, labels = ?, annotations = ?, orphaned = ?, updated_at = ?
            WHERE vm_id = ?
            "#,
        )
        .bind(&vm.host_id)
        .bind(&vm.name)
        .bind(vm.resources.cpu_cores as i64)
        .bind(vm.resources.memory_mb as i64)
        .bind(&vm.image)
        .bind(vm.power_state.as_str())
        .bind(networks_json)
        .bind(labels_json)
        .bind(annotations_json)
        .bind(vm.orphaned)
        .bind(ts(vm.updated_at))
        .bind(&vm.vm_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Update a VM's power state only.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn update_vm_power_state(&self, vm_id: &str, state: PowerState) -> Result<()> {
        sqlx::query("UPDATE vms SET power_state = ?, updated_at = ? WHERE vm_id = ?")
            .bind(state.as_str())
            .bind(ts(Utc::now()))
            .bind(vm_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a VM by ID.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn get_vm(&self, vm_id: &str) -> Result<Vm> {
        self.get_vm_opt(vm_id)
            .await?
            .ok_or_else(|| StratoError::VmNotFound { vm_id: vm_id.to_string() })
    }

    pub async fn get_vm_opt(&self, vm_id: &str) -> Result<Option<Vm>> {
        let row = sqlx::query("SELECT * FROM vms WHERE vm_id = ?")
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        row.map(|r| self.row_to_vm(r)).transpose()
    }

    /// List VM records for a host.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn list_vms(&self, host_id: &str) -> Result<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms WHERE host_id = ? ORDER BY created_at DESC")
            .bind(host_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_vm(row)).collect()
    }

    /// List all VM records across hosts.
    #[instrument(skip(self))]
    pub async fn list_all_vms(&self) -> Result<Vec<Vm>> {
        let rows = sqlx::query("SELECT * FROM vms ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_vm(row)).collect()
    }

    /// Count VMs on a host that are not in the error state.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn live_vm_count(&self, host_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vms WHERE host_id = ? AND power_state != 'error'",
        )
        .bind(host_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(count as u64)
    }

    /// Flag every VM on a host as orphaned (forced host removal).
    ///
    /// Returns the number of records flagged.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn mark_host_vms_orphaned(&self, host_id: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE vms SET orphaned = 1, updated_at = ? WHERE host_id = ?")
            .bind(ts(Utc::now()))
            .bind(host_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Delete a VM record.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM vms WHERE vm_id = ?").bind(vm_id).execute(&self.pool).await.map_err(
            |e| {
                metrics::counter!("strato_db_errors_total", "operation" => "delete_vm").increment(1);
                StratoError::DatabaseError(e.to_string())
            },
        )?;

        Ok(())
    }

    fn row_to_vm(&self, row: SqliteRow) -> Result<Vm> {
        let networks_json: String = row.get("networks");
        let networks: Vec<String> = serde_json::from_str(&networks_json).unwrap_or_default();

        let labels_json: String = row.get("labels");
        let labels: HashMap<String, String> = serde_json::from_str(&labels_json).unwrap_or_default();

        let annotations_json: String = row.get("annotations");
        let annotations: HashMap<String, String> =
            serde_json::from_str(&annotations_json).unwrap_or_default();

        let state_str: String = row.get("power_state");

        Ok(Vm {
            vm_id: row.get("vm_id"),
            host_id: row.get("host_id"),
            name: row.get("name"),
            resources: VmResources {
                cpu_cores: row.get::<i64, _>("cpu_cores") as u32,
                memory_mb: row.get::<i64, _>("memory_mb") as u64,
            },
            image: row.get("image"),
            power_state: PowerState::parse(&state_str),
            networks,
            labels,
            annotations,
            orphaned: row.get("orphaned"),
            created_at: from_ts(row.get("created_at")),
            updated_at: from_ts(row.get("updated_at")),
        })
    }

    // ========================
    // Snapshot Operations
    // ========================

    /// Insert a snapshot reference.
    #[instrument(skip(self), fields(snapshot_id = %snapshot.snapshot_id))]
    pub async fn insert_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (snapshot_id, vm_id, name, captured_power_state,
                                   captured_cpu_cores, captured_memory_mb, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.snapshot_id)
        .bind(&snapshot.vm_id)
        .bind(&snapshot.name)
        .bind(snapshot.captured_power_state.as_str())
        .bind(snapshot.captured_cpu_cores as i64)
        .bind(snapshot.captured_memory_mb as i64)
        .bind(ts(snapshot.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    pub async fn get_snapshot_opt(&self, snapshot_id: &str) -> Result<Option<SnapshotRef>> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        row.map(|r| self.row_to_snapshot(r)).transpose()
    }

    /// List snapshot references for a VM.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn list_snapshots(&self, vm_id: &str) -> Result<Vec<SnapshotRef>> {
        let rows = sqlx::query("SELECT * FROM snapshots WHERE vm_id = ? ORDER BY created_at DESC")
            .bind(vm_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_snapshot(row)).collect()
    }

    /// Delete a snapshot reference.
    #[instrument(skip(self), fields(snapshot_id = %snapshot_id))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Delete all snapshot references for a VM.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn delete_vm_snapshots(&self, vm_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE vm_id = ?")
            .bind(vm_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    fn row_to_snapshot(&self, row: SqliteRow) -> Result<SnapshotRef> {
        let state_str: String = row.get("captured_power_state");

        Ok(SnapshotRef {
            snapshot_id: row.get("snapshot_id"),
            vm_id: row.get("vm_id"),
            name: row.get("name"),
            captured_power_state: PowerState::parse(&state_str),
            captured_cpu_cores: row.get::<i64, _>("captured_cpu_cores") as u32,
            captured_memory_mb: row.get::<i64, _>("captured_memory_mb") as u64,
            created_at: from_ts(row.get("created_at")),
        })
    }

    // ========================
    // Network Operations
    // ========================

    /// Insert a new network.
    #[instrument(skip(self), fields(network_id = %network.network_id))]
    pub async fn insert_network(&self, network: &Network) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO networks (network_id, host_id, name, cidr, vlan_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&network.network_id)
        .bind(&network.host_id)
        .bind(&network.name)
        .bind(&network.cidr)
        .bind(network.vlan_id.map(|v| v as i64))
        .bind(ts(network.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a network by ID.
    #[instrument(skip(self), fields(network_id = %network_id))]
    pub async fn get_network(&self, network_id: &str) -> Result<Network> {
        self.get_network_opt(network_id)
            .await?
            .ok_or_else(|| StratoError::NetworkNotFound { network_id: network_id.to_string() })
    }

    pub async fn get_network_opt(&self, network_id: &str) -> Result<Option<Network>> {
        let row = sqlx::query("SELECT * FROM networks WHERE network_id = ?")
            .bind(network_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        row.map(|r| self.row_to_network(r)).transpose()
    }

    /// List networks for a host.
    #[instrument(skip(self), fields(host_id = %host_id))]
    pub async fn list_networks(&self, host_id: &str) -> Result<Vec<Network>> {
        let rows = sqlx::query("SELECT * FROM networks WHERE host_id = ? ORDER BY created_at DESC")
            .bind(host_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_network(row)).collect()
    }

    /// Check whether a VLAN id is already used by a network on a host.
    #[instrument(skip(self), fields(host_id = %host_id, vlan_id = vlan_id))]
    pub async fn vlan_in_use(&self, host_id: &str, vlan_id: u16) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM networks WHERE host_id = ? AND vlan_id = ?")
                .bind(host_id)
                .bind(vlan_id as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(count > 0)
    }

    /// Delete a network.
    #[instrument(skip(self), fields(network_id = %network_id))]
    pub async fn delete_network(&self, network_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM networks WHERE network_id = ?")
            .bind(network_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    fn row_to_network(&self, row: SqliteRow) -> Result<Network> {
        let vlan_id: Option<i64> = row.get("vlan_id");

        Ok(Network {
            network_id: row.get("network_id"),
            host_id: row.get("host_id"),
            name: row.get("name"),
            cidr: row.get("cidr"),
            vlan_id: vlan_id.map(|v| v as u16),
            created_at: from_ts(row.get("created_at")),
        })
    }

    // ========================
    // Policy Operations
    // ========================

    /// Insert a new policy.
    #[instrument(skip(self), fields(policy_id = %policy.policy_id))]
    pub async fn insert_policy(&self, policy: &Policy) -> Result<()> {
        let rules_json = serde_json::to_string(&policy.rules)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize rules: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO policies (policy_id, name, category, rules, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&policy.policy_id)
        .bind(&policy.name)
        .bind(&policy.category)
        .bind(rules_json)
        .bind(ts(policy.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a policy by ID.
    #[instrument(skip(self), fields(policy_id = %policy_id))]
    pub async fn get_policy(&self, policy_id: &str) -> Result<Policy> {
        let row = sqlx::query("SELECT * FROM policies WHERE policy_id = ?")
            .bind(policy_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?
            .ok_or_else(|| StratoError::PolicyNotFound { policy_id: policy_id.to_string() })?;

        self.row_to_policy(row)
    }

    /// List all policies.
    #[instrument(skip(self))]
    pub async fn list_policies(&self) -> Result<Vec<Policy>> {
        let rows = sqlx::query("SELECT * FROM policies ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_policy(row)).collect()
    }

    /// Insert a policy binding. Fails with `Conflict` on a duplicate tuple.
    #[instrument(skip(self), fields(policy_id = %binding.policy_id))]
    pub async fn insert_binding(&self, binding: &PolicyBinding) -> Result<()> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM policy_bindings WHERE policy_id = ? AND target_kind = ? AND target_id = ?",
        )
        .bind(&binding.policy_id)
        .bind(binding.target_kind.as_str())
        .bind(&binding.target_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        if existing > 0 {
            return Err(StratoError::Conflict {
                reason: format!(
                    "policy {} already bound to {} {}",
                    binding.policy_id,
                    binding.target_kind.as_str(),
                    binding.target_id
                ),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO policy_bindings (policy_id, target_kind, target_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&binding.policy_id)
        .bind(binding.target_kind.as_str())
        .bind(&binding.target_id)
        .bind(ts(binding.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// List bindings for a target, oldest first (creation order breaks ties
    /// during effective-policy resolution).
    #[instrument(skip(self))]
    pub async fn list_bindings_for(
        &self,
        target_kind: PolicyTargetKind,
        target_id: &str,
    ) -> Result<Vec<PolicyBinding>> {
        let rows = sqlx::query(
            "SELECT * FROM policy_bindings WHERE target_kind = ? AND target_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(target_kind.as_str())
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_binding(row)).collect()
    }

    fn row_to_policy(&self, row: SqliteRow) -> Result<Policy> {
        let rules_json: String = row.get("rules");
        let rules = serde_json::from_str(&rules_json)
            .map_err(|e| StratoError::DatabaseError(format!("Failed to deserialize rules: {}", e)))?;

        Ok(Policy {
            policy_id: row.get("policy_id"),
            name: row.get("name"),
            category: row.get("category"),
            rules,
            created_at: from_ts(row.get("created_at")),
        })
    }

    fn row_to_binding(&self, row: SqliteRow) -> Result<PolicyBinding> {
        let kind_str: String = row.get("target_kind");
        let target_kind = PolicyTargetKind::parse(&kind_str)
            .ok_or_else(|| StratoError::DatabaseError(format!("Unknown target kind: {}", kind_str)))?;

        Ok(PolicyBinding {
            policy_id: row.get("policy_id"),
            target_kind,
            target_id: row.get("target_id"),
            created_at: from_ts(row.get("created_at")),
        })
    }

    // ========================
    // Task Operations
    // ========================

    /// Insert a new task.
    #[instrument(skip(self), fields(task_id = %task.task_id))]
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let parameters_json = serde_json::to_string(&task.parameters).map_err(|e| {
            StratoError::DatabaseError(format!("Failed to serialize parameters: {}", e))
        })?;
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize result: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, kind, status, target, parameters, attempt_count,
                               result, error, retry_of, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.kind)
        .bind(task.status.as_str())
        .bind(&task.target)
        .bind(parameters_json)
        .bind(task.attempt_count as i64)
        .bind(result_json)
        .bind(&task.error)
        .bind(&task.retry_of)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Update a task's status and outcome fields.
    #[instrument(skip(self), fields(task_id = %task.task_id))]
    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let result_json = task
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StratoError::DatabaseError(format!("Failed to serialize result: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE tasks SET status = ?, result = ?, error = ?, updated_at = ?
            WHERE task_id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(result_json)
        .bind(&task.error)
        .bind(ts(task.updated_at))
        .bind(&task.task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a task by ID.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?
            .ok_or_else(|| StratoError::TaskNotFound { task_id: task_id.to_string() })?;

        self.row_to_task(row)
    }

    /// List tasks with optional kind/status filters, newest first.
    #[instrument(skip(self))]
    pub async fn list_tasks(
        &self,
        kind: Option<&str>,
        status: Option<TaskStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Task>> {
        let limit = limit.unwrap_or(50) as i64;

        let rows = match (kind, status) {
            (Some(kind), Some(status)) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE kind = ? AND status = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(kind)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (Some(kind), None) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE kind = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(kind)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (None, Some(status)) => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (None, None) => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_task(row)).collect()
    }

    fn row_to_task(&self, row: SqliteRow) -> Result<Task> {
        let status_str: String = row.get("status");

        let parameters_json: String = row.get("parameters");
        let parameters = serde_json::from_str(&parameters_json).unwrap_or(serde_json::Value::Null);

        let result_json: Option<String> = row.get("result");
        let result = result_json.and_then(|s| serde_json::from_str(&s).ok());

        Ok(Task {
            task_id: row.get("task_id"),
            kind: row.get("kind"),
            status: TaskStatus::parse(&status_str),
            target: row.get("target"),
            parameters,
            attempt_count: row.get::<i64, _>("attempt_count") as u32,
            result,
            error: row.get("error"),
            retry_of: row.get("retry_of"),
            created_at: from_ts(row.get("created_at")),
            updated_at: from_ts(row.get("updated_at")),
        })
    }

    // ========================
    // Event Operations
    // ========================

    /// Append an event record.
    #[instrument(skip(self), fields(event_type = %event.event_type))]
    pub async fn insert_event(&self, event: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (event_id, event_type, host_id, project_id, vm_id, detail, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.subjects.host_id)
        .bind(&event.subjects.project_id)
        .bind(&event.subjects.vm_id)
        .bind(&event.detail)
        .bind(ts(event.occurred_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            metrics::counter!("strato_db_errors_total", "operation" => "insert_event").increment(1);
            StratoError::DatabaseError(e.to_string())
        })?;

        Ok(())
    }

    /// List events matching a filter, newest first.
    #[instrument(skip(self, filter))]
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventRecord>> {
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        if filter.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND occurred_at >= ?");
        }
        if filter.subject.is_some() {
            sql.push_str(" AND (host_id = ? OR project_id = ? OR vm_id = ?)");
        }
        sql.push_str(" ORDER BY occurred_at DESC, rowid DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(ref event_type) = filter.event_type {
            query = query.bind(event_type);
        }
        if let Some(since) = filter.since {
            query = query.bind(ts(since));
        }
        if let Some(ref subject) = filter.subject {
            query = query.bind(subject).bind(subject).bind(subject);
        }
        query = query.bind(filter.limit.unwrap_or(50) as i64);

        let rows =
            query.fetch_all(&self.pool).await.map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_event(row)).collect()
    }

    /// Delete events that occurred before the cutoff. Returns the count pruned.
    #[instrument(skip(self))]
    pub async fn prune_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE occurred_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    fn row_to_event(&self, row: SqliteRow) -> Result<EventRecord> {
        Ok(EventRecord {
            event_id: row.get("event_id"),
            event_type: row.get("event_type"),
            subjects: EventSubjects {
                host_id: row.get("host_id"),
                project_id: row.get("project_id"),
                vm_id: row.get("vm_id"),
            },
            detail: row.get("detail"),
            occurred_at: from_ts(row.get("occurred_at")),
        })
    }

    // ========================
    // Project Operations
    // ========================

    /// Insert a new project.
    #[instrument(skip(self), fields(project_id = %project.project_id))]
    pub async fn insert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (project_id, name, description, cpu_cores_quota,
                                  memory_mb_quota, vm_limit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.project_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.quota.cpu_cores as i64)
        .bind(project.quota.memory_mb as i64)
        .bind(project.quota.vm_limit as i64)
        .bind(ts(project.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a project by ID.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.get_project_opt(project_id)
            .await?
            .ok_or_else(|| StratoError::ProjectNotFound { project_id: project_id.to_string() })
    }

    pub async fn get_project_opt(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        row.map(|r| self.row_to_project(r)).transpose()
    }

    /// List all projects.
    #[instrument(skip(self))]
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_project(row)).collect()
    }

    /// Update a project's quota.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn update_project_quota(&self, project_id: &str, quota: Quota) -> Result<()> {
        sqlx::query(
            "UPDATE projects SET cpu_cores_quota = ?, memory_mb_quota = ?, vm_limit = ? WHERE project_id = ?",
        )
        .bind(quota.cpu_cores as i64)
        .bind(quota.memory_mb as i64)
        .bind(quota.vm_limit as i64)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Insert a project member. Fails with `Conflict` on duplicate user.
    #[instrument(skip(self), fields(project_id = %member.project_id, user_id = %member.user_id))]
    pub async fn insert_member(&self, member: &ProjectMember) -> Result<()> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM project_members WHERE project_id = ? AND user_id = ?",
        )
        .bind(&member.project_id)
        .bind(&member.user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        if existing > 0 {
            return Err(StratoError::Conflict {
                reason: format!(
                    "user {} is already a member of project {}",
                    member.user_id, member.project_id
                ),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO project_members (member_id, project_id, user_id, role, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&member.member_id)
        .bind(&member.project_id)
        .bind(&member.user_id)
        .bind(&member.role)
        .bind(ts(member.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// List members of a project.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn list_members(&self, project_id: &str) -> Result<Vec<ProjectMember>> {
        let rows = sqlx::query(
            "SELECT * FROM project_members WHERE project_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StratoError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(|row| self.row_to_member(row)).collect()
    }

    fn row_to_project(&self, row: SqliteRow) -> Result<Project> {
        Ok(Project {
            project_id: row.get("project_id"),
            name: row.get("name"),
            description: row.get("description"),
            quota: Quota {
                cpu_cores: row.get::<i64, _>("cpu_cores_quota") as u32,
                memory_mb: row.get::<i64, _>("memory_mb_quota") as u64,
                vm_limit: row.get::<i64, _>("vm_limit") as u32,
            },
            created_at: from_ts(row.get("created_at")),
        })
    }

    fn row_to_member(&self, row: SqliteRow) -> Result<ProjectMember> {
        Ok(ProjectMember {
            member_id: row.get("member_id"),
            project_id: row.get("project_id"),
            user_id: row.get("user_id"),
            role: row.get("role"),
            created_at: from_ts(row.get("created_at")),
        })
    }
}
