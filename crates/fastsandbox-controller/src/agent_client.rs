//! Client for the Controller-to-Agent HTTP surface (`spec.md` §4.2). The
//! Agent's JSON API, not gRPC — the Controller only ever pulls Agent state,
//! it never pushes a persistent connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct CreateRequest<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub sandbox_id: &'a str,
    pub claim_uid: &'a str,
    pub image: &'a str,
    #[serde(default)]
    pub command: &'a [String],
    #[serde(default)]
    pub args: &'a [String],
    #[serde(default)]
    pub env: &'a std::collections::HashMap<String, String>,
    #[serde(default)]
    pub exposed_ports: &'a [u16],
}

#[derive(Debug, Deserialize)]
pub struct CreateResponse {
    pub endpoints: Vec<fastsandbox_types::model::Endpoint>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    sandbox_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentStateResponse {
    pub capacity: u32,
    pub allocated: u32,
    #[serde(default)]
    pub images: Vec<String>,
    pub sandbox_statuses: Vec<AgentSandboxEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentSandboxEntry {
    pub sandbox_id: String,
    pub claim_uid: String,
    pub phase: fastsandbox_types::model::AgentReportedPhase,
    pub message: String,
}

/// Client bound to one Agent's pod IP.
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    pub fn new(pod_ip: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{pod_ip}:{port}"),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client config is static and valid"),
        }
    }

    pub async fn create_sandbox(
        &self,
        req: &CreateRequest<'_>,
    ) -> Result<CreateResponse, AgentClientError> {
        let url = format!("{}/api/v1/agent/create", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| AgentClientError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AgentClientError::Rpc(format!(
                "create_sandbox returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| AgentClientError::Rpc(e.to_string()))
    }

    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), AgentClientError> {
        let url = format!("{}/api/v1/agent/delete", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&DeleteRequest { sandbox_id })
            .send()
            .await
            .map_err(|e| AgentClientError::Connection(e.to_string()))?;

        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(AgentClientError::Rpc(format!(
                "delete_sandbox returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<AgentStateResponse, AgentClientError> {
        let url = format!("{}/api/v1/agent/status", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentClientError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AgentClientError::Rpc(format!(
                "status returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| AgentClientError::Rpc(e.to_string()))
    }

    /// Open a streaming connection to the Agent's log endpoint. The caller
    /// consumes `reqwest::Response::bytes_stream()`; `follow` keeps the
    /// Agent side open until the container exits or this connection drops.
    pub async fn logs(
        &self,
        sandbox_id: &str,
        follow: bool,
    ) -> Result<reqwest::Response, AgentClientError> {
        let url = format!(
            "{}/api/v1/agent/logs?sandboxID={}&follow={}",
            self.base_url, sandbox_id, follow
        );
        // `follow=true` is a long-lived chunked stream; the client's default
        // request timeout only makes sense for the request/response calls.
        let mut request = self.http.get(&url);
        if follow {
            request = request.timeout(Duration::from_secs(3600));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| AgentClientError::Connection(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AgentClientError::Rpc(format!(
                "logs returned {}",
                resp.status()
            )));
        }
        Ok(resp)
    }

    /// Poll `/healthz` until the Agent reports ready, used right after an
    /// Agent is registered so the Controller doesn't route traffic to a
    /// not-yet-warmed-up pod.
    pub async fn wait_for_health(&self, timeout: Duration) -> Result<(), AgentClientError> {
        let start = tokio::time::Instant::now();
        let interval = Duration::from_millis(200);
        let url = format!("{}/healthz", self.base_url);

        info!(url = %url, timeout_ms = timeout.as_millis(), "waiting for agent health");

        while start.elapsed() < timeout {
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(url = %url, elapsed_ms = start.elapsed().as_millis(), "agent is healthy");
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), "agent responded but not ready");
                }
                Err(_) => {}
            }
            tokio::time::sleep(interval).await;
        }

        Err(AgentClientError::HealthTimeout(format!(
            "agent at {url} did not become healthy within {timeout:?}"
        )))
    }
}

#[derive(Debug)]
pub enum AgentClientError {
    HealthTimeout(String),
    Connection(String),
    Rpc(String),
}

impl std::fmt::Display for AgentClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentClientError::HealthTimeout(msg) => write!(f, "health timeout: {msg}"),
            AgentClientError::Connection(msg) => write!(f, "connection error: {msg}"),
            AgentClientError::Rpc(msg) => write!(f, "rpc error: {msg}"),
        }
    }
}

impl std::error::Error for AgentClientError {}
