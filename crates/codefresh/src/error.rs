//! Error types for the Codefresh client.

use thiserror::Error;

use crate::task::TaskType;

/// Errors returned by calls to the Codefresh API.
#[derive(Debug, Error)]
pub enum CodefreshError {
    /// The API answered with a non-success status code.
    #[error("HTTP request to Codefresh API rejected. Status-Code: {status}. Message: {body}")]
    Network { status: u16, body: String },

    /// The request never got a response (connect, TLS, timeout...).
    #[error("HTTP request to Codefresh API failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The configured host is not a valid URL.
    #[error("invalid Codefresh host URL: {0}")]
    Url(#[from] url::ParseError),

    /// The configured host cannot carry a path (e.g. `mailto:`).
    #[error("Codefresh host cannot be used as a base URL: {0}")]
    InvalidHost(String),

    /// Request or response body could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodefreshError {
    /// HTTP status code of a rejected request, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// A single task from the API could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The task envelope (type, metadata) is malformed or of an unknown type.
    #[error("malformed task: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope is fine but the spec does not match its type.
    #[error("failed to decode spec of {task_type} task: {source}")]
    Spec {
        task_type: TaskType,
        #[source]
        source: serde_json::Error,
    },
}
