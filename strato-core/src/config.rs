//! Configuration management.

use crate::error::{Result, StratoError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Persistent configuration for STRATO.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    /// Agent client backend: "mock" or "http".
    pub agent_mode: String,
    /// TCP port host agents listen on.
    pub agent_port: u16,
    /// Timeout for a single agent request, in seconds.
    pub agent_timeout_secs: u64,
    /// Interval at which agents are expected to push heartbeats.
    pub heartbeat_interval_secs: u64,
    /// A host with no heartbeat within this window is reported unresponsive.
    /// Zero means "derive from the heartbeat interval" (3x).
    pub heartbeat_timeout_secs: u64,
    /// Events older than this are pruned by the retention sweep.
    pub event_retention_days: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            agent_mode: "http".to_string(),
            agent_port: 9090,
            agent_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 0,
            event_retention_days: 30,
            log_level: "info".to_string(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.strato/strato.db", home)
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("STRATO_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".strato").join("config.json")
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| StratoError::InvalidConfig {
                reason: format!("Failed to read config: {}", e),
            })?;
            serde_json::from_str(&content).map_err(|e| StratoError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?
        } else {
            Self::default()
        };

        if let Ok(db_path) = std::env::var("STRATO_DB_PATH") {
            config.db_path = db_path;
        }
        if let Ok(mode) = std::env::var("STRATO_AGENT_MODE") {
            config.agent_mode = mode;
        }
        if let Ok(level) = std::env::var("STRATO_LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StratoError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| StratoError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(&path, content).map_err(|e| StratoError::IoError { path, source: e })
    }

    /// Timeout for a single agent request.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Effective heartbeat timeout: explicit value, or 3x the heartbeat interval.
    pub fn heartbeat_timeout(&self) -> Duration {
        if self.heartbeat_timeout_secs > 0 {
            Duration::from_secs(self.heartbeat_timeout_secs)
        } else {
            Duration::from_secs(self.heartbeat_interval_secs * 3)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_timeout_derived_from_interval() {
        let config = Config { heartbeat_interval_secs: 15, heartbeat_timeout_secs: 0, ..Default::default() };
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(45));

        let explicit = Config { heartbeat_timeout_secs: 20, ..Default::default() };
        assert_eq!(explicit.heartbeat_timeout(), Duration::from_secs(20));
    }
}
