//! Agent client factory.
//!
//! Selects the agent backend from configuration. The orchestrator depends
//! only on the `AgentClient` trait, so backends can be swapped without
//! touching dispatch logic.

use crate::agent::{AgentClient, HttpAgentClient, MockAgentClient};
use crate::config::Config;
use crate::error::{Result, StratoError};
use std::sync::Arc;
use tracing::{info, instrument};

/// Factory for creating agent clients.
pub struct AgentFactory;

impl AgentFactory {
    /// Create an agent client for the configured mode.
    ///
    /// - `"mock"`: in-memory simulation, no agents required
    /// - `"http"`: JSON over HTTP to real host agents
    #[instrument(skip(config))]
    pub fn create(config: &Config) -> Result<Arc<dyn AgentClient>> {
        match config.agent_mode.as_str() {
            "mock" => {
                info!("Using mock agent backend");
                Ok(Arc::new(MockAgentClient::new()))
            }
            "http" => {
                info!(port = config.agent_port, "Using HTTP agent backend");
                Ok(Arc::new(HttpAgentClient::new(config.agent_port, config.agent_timeout())?))
            }
            other => Err(StratoError::InvalidConfig {
                reason: format!("Unknown agent mode '{}'. Valid options: mock, http", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_unknown_mode() {
        let config = Config { agent_mode: "carrier-pigeon".to_string(), ..Default::default() };
        let result = AgentFactory::create(&config);
        assert!(matches!(result, Err(StratoError::InvalidConfig { .. })));
    }

    #[test]
    fn test_factory_creates_mock() {
        let config = Config { agent_mode: "mock".to_string(), ..Default::default() };
        let client = AgentFactory::create(&config).unwrap();
        assert_eq!(client.name(), "mock");
    }
}
