//! HTTP client for the Codefresh agent API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::error::CodefreshError;
use crate::task::{decode_task, Task};

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "https://g.codefresh.io";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Health snapshot pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub message: String,
}

impl AgentStatus {
    /// The status reported while the agent is operating normally.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            message: "All good".to_string(),
        }
    }
}

/// Control-plane operations the agent depends on.
#[async_trait]
pub trait Codefresh: Send + Sync {
    /// Pending tasks for this agent. Empty when there is nothing to do.
    async fn tasks(&self) -> Result<Vec<Task>, CodefreshError>;

    /// Push a health snapshot.
    async fn report_status(&self, status: &AgentStatus) -> Result<(), CodefreshError>;

    /// Base URL of the API.
    fn host(&self) -> &str;
}

/// Options for building a [`CodefreshClient`].
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// API host, [`DEFAULT_HOST`] when `None` or empty.
    pub host: Option<String>,
    pub token: String,
    pub agent_id: String,
    /// Extra headers sent with every request (e.g. `User-Agent`).
    pub headers: HeaderMap,
    /// Skip TLS certificate validation.
    pub accept_invalid_certs: bool,
    /// Per-request timeout, 30s when `None`.
    pub timeout: Option<Duration>,
}

/// reqwest implementation of [`Codefresh`].
#[derive(Debug, Clone)]
pub struct CodefreshClient {
    host: String,
    token: String,
    agent_id: String,
    client: Client,
}

impl CodefreshClient {
    /// Build a client.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(opts: ClientOptions) -> Result<Self, CodefreshError> {
        let host = opts
            .host
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let client = Client::builder()
            .timeout(
                opts.timeout
                    .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            )
            .default_headers(opts.headers)
            .danger_accept_invalid_certs(opts.accept_invalid_certs)
            .build()?;

        Ok(Self {
            host,
            token: opts.token,
            agent_id: opts.agent_id,
            client,
        })
    }

    /// Join `segments` onto the host, escaping each one on its own so a `/`
    /// inside a segment never becomes a path separator.
    pub(crate) fn prepare_url(&self, segments: &[&str]) -> Result<Url, CodefreshError> {
        let mut url = Url::parse(&self.host)?;
        url.path_segments_mut()
            .map_err(|()| CodefreshError::InvalidHost(self.host.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn do_request(
        &self,
        method: Method,
        body: Option<Vec<u8>>,
        segments: &[&str],
    ) -> Result<String, CodefreshError> {
        let url = self.prepare_url(segments)?;
        debug!(method = %method, url = %url, "Codefresh API request");

        let mut request = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, &self.token);
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() >= 400 {
            return Err(CodefreshError::Network {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }
}

#[async_trait]
impl Codefresh for CodefreshClient {
    async fn tasks(&self) -> Result<Vec<Task>, CodefreshError> {
        let body = self
            .do_request(
                Method::GET,
                None,
                &["api", "agent", &self.agent_id, "tasks"],
            )
            .await?;

        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        let raw: Option<Vec<Value>> = serde_json::from_str(&body)?;
        let tasks = raw
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| match decode_task(value) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "Skipping task that could not be decoded");
                    None
                }
            })
            .collect();

        Ok(tasks)
    }

    async fn report_status(&self, status: &AgentStatus) -> Result<(), CodefreshError> {
        let body = serde_json::to_vec(status)?;
        self.do_request(
            Method::PUT,
            Some(body),
            &["api", "agent", &self.agent_id, "status"],
        )
        .await?;
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}
