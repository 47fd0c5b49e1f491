//! Database migrations.

use crate::error::{Result, StratoError};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 3;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    // Create schema_version table if not exists
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    // Get current schema version
    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    if current_version < 3 {
        migrate_to_v3(pool).await?;
    }

    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

/// Migration to schema version 1: inventory tables (hosts, VMs, networks, snapshots).
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // Hosts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hosts (
            host_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'unknown',
            cpu_cores INTEGER NOT NULL DEFAULT 0,
            memory_mb INTEGER NOT NULL DEFAULT 0,
            observed_cpu_cores INTEGER NOT NULL DEFAULT 0,
            observed_memory_mb INTEGER NOT NULL DEFAULT 0,
            hypervisor_uri TEXT NOT NULL DEFAULT 'qemu:///system',
            last_heartbeat_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hosts_status ON hosts(status)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_hosts_updated ON hosts(updated_at)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    // VMs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vms (
            vm_id TEXT PRIMARY KEY,
            host_id TEXT NOT NULL,
            name TEXT NOT NULL,
            cpu_cores INTEGER NOT NULL,
            memory_mb INTEGER NOT NULL,
            image TEXT NOT NULL,
            power_state TEXT NOT NULL,
            networks TEXT NOT NULL DEFAULT '[]',
            labels TEXT NOT NULL DEFAULT '{}',
            annotations TEXT NOT NULL DEFAULT '{}',
            orphaned INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_host ON vms(host_id)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_state ON vms(power_state)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    // Networks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS networks (
            network_id TEXT PRIMARY KEY,
            host_id TEXT NOT NULL,
            name TEXT NOT NULL,
            cidr TEXT NOT NULL,
            vlan_id INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_networks_host ON networks(host_id)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    // Snapshot references
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            snapshot_id TEXT PRIMARY KEY,
            vm_id TEXT NOT NULL,
            name TEXT NOT NULL,
            captured_power_state TEXT NOT NULL,
            captured_cpu_cores INTEGER NOT NULL,
            captured_memory_mb INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_vm ON snapshots(vm_id)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 1).await?;

    info!("Migration to schema version 1 complete");
    Ok(())
}

/// Migration to schema version 2: policies, bindings, tasks, events.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            policy_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'governance',
            rules TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policy_bindings (
            policy_id TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (policy_id, target_kind, target_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bindings_target ON policy_bindings(target_kind, target_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            target TEXT NOT NULL DEFAULT 'platform',
            parameters TEXT NOT NULL DEFAULT '{}',
            attempt_count INTEGER NOT NULL DEFAULT 1,
            result TEXT,
            error TEXT,
            retry_of TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_kind ON tasks(kind)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            host_id TEXT,
            project_id TEXT,
            vm_id TEXT,
            detail TEXT NOT NULL DEFAULT '',
            occurred_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_time ON events(occurred_at)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 2).await?;

    info!("Migration to schema version 2 complete");
    Ok(())
}

/// Migration to schema version 3: projects and membership.
#[instrument(skip(pool))]
async fn migrate_to_v3(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 3");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            project_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            cpu_cores_quota INTEGER NOT NULL DEFAULT 0,
            memory_mb_quota INTEGER NOT NULL DEFAULT 0,
            vm_limit INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_members (
            member_id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'viewer',
            created_at INTEGER NOT NULL,
            UNIQUE (project_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_project ON project_members(project_id)")
        .execute(pool)
        .await
        .map_err(|e| StratoError::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 3).await?;

    info!("Migration to schema version 3 complete");
    Ok(())
}
