//! HTTP agent client.
//!
//! Talks JSON to the agent process on each hypervisor host. Transport
//! failures (connect, timeout) surface as `AgentUnreachable`; HTTP error
//! responses carry an agent-defined `{code, message}` payload surfaced
//! verbatim as `AgentError`.

use crate::agent::{
    AgentClient, AgentHealth, AgentNetwork, AgentSnapshot, AgentVm, CreateNetworkRequest,
    CreateVmRequest,
};
use crate::error::{Result, StratoError};
use crate::types::{Host, VmAction};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

/// Error payload returned by a host agent.
#[derive(Debug, Deserialize)]
struct AgentErrorPayload {
    code: Option<String>,
    message: Option<String>,
    // Legacy agents report errors as {"detail": "..."}.
    detail: Option<String>,
}

/// JSON-over-HTTP client for remote host agents.
pub struct HttpAgentClient {
    client: reqwest::Client,
    agent_port: u16,
}

impl HttpAgentClient {
    pub fn new(agent_port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StratoError::InvalidConfig {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, agent_port })
    }

    fn base_url(&self, host: &Host) -> String {
        format!("http://{}:{}", host.address, self.agent_port)
    }

    fn unreachable(host: &Host, err: reqwest::Error) -> StratoError {
        let reason = if err.is_timeout() {
            "request timed out".to_string()
        } else {
            err.to_string()
        };
        StratoError::AgentUnreachable { host_id: host.host_id.clone(), reason }
    }

    /// Decode a response: 2xx bodies deserialize to T, everything else becomes
    /// an `AgentError` built from the agent's error payload.
    async fn decode<T: serde::de::DeserializeOwned>(
        host: &Host,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| StratoError::Internal(format!(
                "Failed to decode agent response from {}: {}",
                host.host_id, e
            )));
        }

        let payload: AgentErrorPayload = response
            .json()
            .await
            .unwrap_or(AgentErrorPayload { code: None, message: None, detail: None });

        let code = payload.code.unwrap_or_else(|| status.as_u16().to_string());
        let message = payload
            .message
            .or(payload.detail)
            .unwrap_or_else(|| format!("agent returned HTTP {}", status));

        debug!(host_id = %host.host_id, code = %code, "Agent reported error");
        Err(StratoError::AgentError { code, message })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, host: &Host, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url(host), path);
        let response =
            self.client.get(&url).send().await.map_err(|e| Self::unreachable(host, e))?;
        Self::decode(host, response).await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        host: &Host,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url(host), path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::unreachable(host, e))?;
        Self::decode(host, response).await
    }

    async fn delete_req(&self, host: &Host, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url(host), path);
        let response =
            self.client.delete(&url).send().await.map_err(|e| Self::unreachable(host, e))?;
        Self::decode(host, response).await
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    #[instrument(skip(self, host), fields(host_id = %host.host_id))]
    async fn health(&self, host: &Host) -> Result<AgentHealth> {
        self.get(host, "/healthz").await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id))]
    async fn list_vms(&self, host: &Host) -> Result<Vec<AgentVm>> {
        self.get(host, "/agent/vms").await
    }

    #[instrument(skip(self, host, req), fields(host_id = %host.host_id, name = %req.name))]
    async fn create_vm(&self, host: &Host, req: &CreateVmRequest) -> Result<AgentVm> {
        let body = json!({
            "name": req.name,
            "cpu_cores": req.cpu_cores,
            "memory_mb": req.memory_mb,
            "image": req.image,
        });
        self.post(host, "/agent/vms", &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn vm_action(&self, host: &Host, vm_id: &str, action: VmAction) -> Result<AgentVm> {
        let body = json!({ "action": action.as_str() });
        self.post(host, &format!("/agent/vms/{}/action", vm_id), &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn resize_vm(
        &self,
        host: &Host,
        vm_id: &str,
        cpu_cores: u32,
        memory_mb: u64,
    ) -> Result<AgentVm> {
        let body = json!({ "cpu_cores": cpu_cores, "memory_mb": memory_mb });
        self.post(host, &format!("/agent/vms/{}/resize", vm_id), &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn delete_vm(&self, host: &Host, vm_id: &str) -> Result<()> {
        self.delete_req(host, &format!("/agent/vms/{}", vm_id)).await?;
        Ok(())
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn clone_vm(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentVm> {
        let body = json!({ "name": name });
        self.post(host, &format!("/agent/vms/{}/clone", vm_id), &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn export_vm(&self, host: &Host, vm_id: &str) -> Result<AgentVm> {
        self.get(host, &format!("/agent/vms/{}/export", vm_id)).await
    }

    #[instrument(skip(self, host, vm), fields(host_id = %host.host_id, vm_id = %vm.vm_id))]
    async fn import_vm(&self, host: &Host, vm: &AgentVm) -> Result<AgentVm> {
        let body = serde_json::to_value(vm)
            .map_err(|e| StratoError::Internal(format!("Failed to encode VM export: {}", e)))?;
        self.post(host, "/agent/vms/import", &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn create_snapshot(&self, host: &Host, vm_id: &str, name: &str) -> Result<AgentSnapshot> {
        let body = json!({ "name": name });
        self.post(host, &format!("/agent/vms/{}/snapshots", vm_id), &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn list_snapshots(&self, host: &Host, vm_id: &str) -> Result<Vec<AgentSnapshot>> {
        self.get(host, &format!("/agent/vms/{}/snapshots", vm_id)).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn revert_snapshot(
        &self,
        host: &Host,
        vm_id: &str,
        snapshot_id: &str,
    ) -> Result<AgentVm> {
        let body = json!({});
        self.post(host, &format!("/agent/vms/{}/snapshots/{}/revert", vm_id, snapshot_id), &body)
            .await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, vm_id = %vm_id))]
    async fn delete_snapshot(&self, host: &Host, vm_id: &str, snapshot_id: &str) -> Result<()> {
        self.delete_req(host, &format!("/agent/vms/{}/snapshots/{}", vm_id, snapshot_id)).await?;
        Ok(())
    }

    #[instrument(skip(self, host, req), fields(host_id = %host.host_id, name = %req.name))]
    async fn create_network(
        &self,
        host: &Host,
        req: &CreateNetworkRequest,
    ) -> Result<AgentNetwork> {
        let body = json!({ "name": req.name, "cidr": req.cidr, "vlan_id": req.vlan_id });
        self.post(host, "/agent/networks", &body).await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id))]
    async fn list_networks(&self, host: &Host) -> Result<Vec<AgentNetwork>> {
        self.get(host, "/agent/networks").await
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, network_id = %network_id))]
    async fn attach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()> {
        let body = json!({ "vm_id": vm_id });
        let _: serde_json::Value =
            self.post(host, &format!("/agent/networks/{}/attach", network_id), &body).await?;
        Ok(())
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, network_id = %network_id))]
    async fn detach_network(&self, host: &Host, network_id: &str, vm_id: &str) -> Result<()> {
        let body = json!({ "vm_id": vm_id });
        let _: serde_json::Value =
            self.post(host, &format!("/agent/networks/{}/detach", network_id), &body).await?;
        Ok(())
    }

    #[instrument(skip(self, host), fields(host_id = %host.host_id, network_id = %network_id))]
    async fn delete_network(&self, host: &Host, network_id: &str) -> Result<()> {
        self.delete_req(host, &format!("/agent/networks/{}", network_id)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}
