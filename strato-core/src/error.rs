//! Error types for STRATO.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for STRATO operations.
pub type Result<T> = std::result::Result<T, StratoError>;

/// Main error type for STRATO.
#[derive(Error, Debug)]
pub enum StratoError {
    // Lookup errors
    #[error("Host not found: {host_id}")]
    HostNotFound { host_id: String },

    #[error("VM not found: {vm_id}")]
    VmNotFound { vm_id: String },

    #[error("Network not found: {network_id}")]
    NetworkNotFound { network_id: String },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Policy not found: {policy_id}")]
    PolicyNotFound { policy_id: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Project not found: {project_id}")]
    ProjectNotFound { project_id: String },

    // State errors
    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("Invalid transition for VM {vm_id}: {action} not legal from {from}")]
    InvalidTransition { vm_id: String, from: String, action: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("Quota exceeded: {reason}")]
    QuotaExceeded { reason: String },

    // Agent errors
    #[error("Agent unreachable for host {host_id}: {reason}")]
    AgentUnreachable { host_id: String, reason: String },

    #[error("Agent error [{code}]: {message}")]
    AgentError { code: String, message: String },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StratoError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// True if the error was detected before any agent call was issued.
    ///
    /// Pre-dispatch errors guarantee no partial side effects.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            Self::HostNotFound { .. }
                | Self::VmNotFound { .. }
                | Self::NetworkNotFound { .. }
                | Self::SnapshotNotFound { .. }
                | Self::PolicyNotFound { .. }
                | Self::TaskNotFound { .. }
                | Self::ProjectNotFound { .. }
                | Self::Conflict { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidState { .. }
                | Self::PolicyDenied { .. }
                | Self::QuotaExceeded { .. }
        )
    }
}
