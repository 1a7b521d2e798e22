//! HTTP client for the control API, used by the proxy and by tooling

use crate::provider::{AgentInfo, MemoryUsage, RuntimeInfo};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The dispatcher answered 503; it is still initializing
    #[error("dispatcher is not available yet")]
    NotAvailable,

    /// Credentials were rejected
    #[error("invalid credentials")]
    Forbidden,

    /// The agent does not exist
    #[error("no such agent")]
    NotFound,

    /// A state conflict, carrying the dispatcher's stable error code
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success answer
    #[error("unexpected status {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct AgentsResponse {
    agents: Vec<AgentInfo>,
}

/// Typed client for the control API.
///
/// Errors mirror the dispatcher's error classes so callers can distinguish
/// "not yet available" from "does not exist" without status-code plumbing.
#[derive(Clone)]
pub struct DispatcherClient {
    base_url: String,
    http: reqwest::Client,
}

impl DispatcherClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn list(&self) -> Result<Vec<AgentInfo>, ClientError> {
        let resp = self.http.get(self.url("/agents")).send().await?;
        let body: AgentsResponse = check(resp).await?.json().await?;
        Ok(body.agents)
    }

    pub async fn agent(&self, name: &str) -> Result<AgentInfo, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/agents/{}", name)))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn agent_exists(&self, name: &str) -> Result<bool, ClientError> {
        match self.agent(name).await {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn runtime(&self, name: &str) -> Result<RuntimeInfo, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/agents/{}/runtime", name)))
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn add(&self, name: &str, password: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url("/agents"))
            .json(&serde_json::json!({ "name": name, "password": password }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), ClientError> {
        self.set_state(name, "running").await
    }

    pub async fn stop(&self, name: &str) -> Result<(), ClientError> {
        self.set_state(name, "stopped").await
    }

    async fn set_state(&self, name: &str, state: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .put(self.url(&format!("/agents/{}/state", name)))
            .json(&serde_json::json!({ "state": state }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// True when the secret matches, false when the dispatcher rejects it
    pub async fn authenticate(&self, name: &str, password: &str) -> Result<bool, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/agents/{}/authenticate", name)))
            .json(&serde_json::json!({ "password": password }))
            .send()
            .await?;
        match check(resp).await {
            Ok(_) => Ok(true),
            Err(ClientError::Forbidden) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn memory_usage(&self) -> Result<MemoryUsage, ClientError> {
        let resp = self.http.get(self.url("/stats/memory_usage")).send().await?;
        Ok(check(resp).await?.json().await?)
    }
}

/// Translate a response status into the client's error classes
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let code = resp
        .headers()
        .get("x-agentgate-error")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match status.as_u16() {
        503 => Err(ClientError::NotAvailable),
        403 => Err(ClientError::Forbidden),
        404 => Err(ClientError::NotFound),
        409 => Err(ClientError::Conflict(
            code.unwrap_or_else(|| "CONFLICT".to_string()),
        )),
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::Unexpected {
                status: status.as_u16(),
                body,
            })
        }
    }
}
