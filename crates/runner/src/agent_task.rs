//! Tasks the agent executes itself instead of handing them to a runtime.
//!
//! The only executor today is `proxy`: forward the task params to a URL on
//! behalf of a running workflow.

use std::time::Duration;

use codefresh::AgentTaskSpec;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Executor name of the proxy task.
pub const PROXY_TASK_TYPE: &str = "proxy";

const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_REQUEST_RETRIES: u32 = 3;
const PROXY_RETRY_DELAY: Duration = Duration::from_secs(1);

const TOKEN_POINTER: &str = "/runtimeContext/context/eventReporting/token";
const URL_POINTER: &str = "/runtimeContext/context/variables/proxyUrl";
const METHOD_POINTER: &str = "/runtimeContext/context/variables/method";

#[derive(Debug, Error)]
pub enum AgentTaskError {
    #[error("agent task has unknown type \"{0}\"")]
    UnknownType(String),

    #[error("token not provided for task of type \"proxy\"")]
    MissingToken,

    #[error("url not provided for task of type \"proxy\"")]
    MissingUrl,

    #[error("invalid HTTP method \"{0}\"")]
    InvalidMethod(String),

    #[error("failed to serialize agent task params: {0}")]
    Params(#[from] serde_json::Error),

    #[error("failed sending request: {0}")]
    Http(#[from] reqwest::Error),
}

/// Runs agent tasks.
#[derive(Debug, Clone)]
pub struct AgentTaskExecutor {
    client: Client,
    retries: u32,
    retry_delay: Duration,
}

impl AgentTaskExecutor {
    /// Executor with the default proxy timeout and retry policy.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, AgentTaskError> {
        let client = Client::builder().timeout(PROXY_REQUEST_TIMEOUT).build()?;
        Ok(Self::with_client(client))
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            retries: PROXY_REQUEST_RETRIES,
            retry_delay: PROXY_RETRY_DELAY,
        }
    }

    /// Override the delay before the first retry. Later retries back off
    /// exponentially.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Execute `spec` with the executor its type names.
    ///
    /// # Errors
    /// Returns error for unknown types, malformed params, or when the
    /// request cannot be delivered after all retries.
    pub async fn execute(&self, spec: &AgentTaskSpec) -> Result<(), AgentTaskError> {
        match spec.kind.as_str() {
            PROXY_TASK_TYPE => self.proxy(spec).await,
            other => Err(AgentTaskError::UnknownType(other.to_string())),
        }
    }

    async fn proxy(&self, spec: &AgentTaskSpec) -> Result<(), AgentTaskError> {
        let params = Value::Object(spec.params.clone());
        let token = non_empty_str(&params, TOKEN_POINTER).ok_or(AgentTaskError::MissingToken)?;
        let url = non_empty_str(&params, URL_POINTER).ok_or(AgentTaskError::MissingUrl)?;
        let method_name = non_empty_str(&params, METHOD_POINTER).unwrap_or("POST");
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| AgentTaskError::InvalidMethod(method_name.to_string()))?;
        let body = serde_json::to_vec(&params)?;

        info!(url = %url, method = %method, "Executing proxy task");

        let mut attempt = 0;
        let response = loop {
            let result = self
                .client
                .request(method.clone(), url)
                .header("x-req-type", "workflow-request")
                .header("x-access-token", token)
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;

            let retryable = match &result {
                Ok(resp) => resp.status().is_server_error(),
                Err(_) => true,
            };
            if !retryable || attempt >= self.retries {
                break result?;
            }

            let delay = self.retry_delay * 2u32.saturating_pow(attempt);
            attempt += 1;
            match &result {
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), attempt, "Proxy request failed, retrying");
                }
                Err(e) => warn!(url = %url, error = %e, attempt, "Proxy request failed, retrying"),
            }
            tokio::time::sleep(delay).await;
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!(
            url = %url,
            method = %method,
            status = %status,
            body = %body,
            "Finished proxy task"
        );
        Ok(())
    }
}

fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
