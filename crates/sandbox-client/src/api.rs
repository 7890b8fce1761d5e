//! Control-plane API client: sandbox CRUD over REST with JSON bodies.
//!
//! The control plane is an external collaborator; this module implements
//! only the handful of calls the session engine needs. Authentication is an
//! API-key header on every request.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

const API_KEY_HEADER: &str = "X-API-Key";

/// Lifecycle state of a sandbox as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SandboxState {
    Running,
    Paused,
}

impl SandboxState {
    fn as_query(self) -> &'static str {
        match self {
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
        }
    }
}

/// A sandbox record, including the connection info the data plane needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub template_id: String,
    pub state: SandboxState,
    /// Absolute deadline after which the sandbox expires; extendable via
    /// `set_timeout`.
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Daemon endpoint (`host` or `host:port`).
    pub daemon_host: String,
    /// Access token for the data-plane handshake and signed URLs.
    pub access_token: String,
}

/// Filter for listing sandboxes.
#[derive(Debug, Clone, Default)]
pub struct SandboxQuery {
    pub state: Option<SandboxState>,
}

/// One page of sandbox listings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPage {
    pub items: Vec<SandboxInfo>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxBody<'a> {
    template_id: &'a str,
    timeout_ms: u64,
    metadata: &'a HashMap<String, String>,
    env_vars: &'a HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetTimeoutBody {
    timeout_ms: u64,
}

pub(crate) struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Sandbox(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a request; non-2xx statuses translate through the taxonomy.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Sandbox(format!("api request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::from_http(status.as_u16(), message))
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Sandbox(format!("malformed api response: {e}")))
    }

    pub(crate) async fn create_sandbox(
        &self,
        template_id: &str,
        timeout: Duration,
        metadata: &HashMap<String, String>,
        env_vars: &HashMap<String, String>,
    ) -> Result<SandboxInfo> {
        let body = CreateSandboxBody {
            template_id,
            timeout_ms: timeout.as_millis() as u64,
            metadata,
            env_vars,
        };
        let response = self
            .execute(self.http.post(self.url("/sandboxes")).json(&body))
            .await?;
        Self::json(response).await
    }

    pub(crate) async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .execute(self.http.get(self.url(&format!("/sandboxes/{sandbox_id}"))))
            .await?;
        Self::json(response).await
    }

    pub(crate) async fn list_sandboxes(
        &self,
        query: &SandboxQuery,
        page_token: Option<&str>,
    ) -> Result<SandboxPage> {
        let mut request = self.http.get(self.url("/sandboxes"));
        if let Some(state) = query.state {
            request = request.query(&[("state", state.as_query())]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let response = self.execute(request).await?;
        Self::json(response).await
    }

    pub(crate) async fn pause_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .execute(
                self.http
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/pause"))),
            )
            .await?;
        Self::json(response).await
    }

    pub(crate) async fn resume_sandbox(&self, sandbox_id: &str) -> Result<SandboxInfo> {
        let response = self
            .execute(
                self.http
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/resume"))),
            )
            .await?;
        Self::json(response).await
    }

    /// Kill a sandbox. Returns `false` for an already-gone sandbox instead
    /// of raising not-found.
    pub(crate) async fn kill_sandbox(&self, sandbox_id: &str) -> Result<bool> {
        let request = self.http.delete(self.url(&format!("/sandboxes/{sandbox_id}")));
        match self.execute(request).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Extend (or shorten) the sandbox's lifetime from now.
    pub(crate) async fn set_timeout(
        &self,
        sandbox_id: &str,
        timeout: Duration,
    ) -> Result<SandboxInfo> {
        let body = SetTimeoutBody {
            timeout_ms: timeout.as_millis() as u64,
        };
        let response = self
            .execute(
                self.http
                    .post(self.url(&format!("/sandboxes/{sandbox_id}/timeout")))
                    .json(&body),
            )
            .await?;
        Self::json(response).await
    }
}
