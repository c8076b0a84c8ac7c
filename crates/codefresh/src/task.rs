//! Task model.
//!
//! On the wire a task is `{"type", "spec", "metadata"}` where the shape of
//! `spec` depends on `type`, and may itself arrive as a JSON-encoded string.
//! [`Task`] only exists in decoded form: the spec is a [`TaskSpec`] variant
//! carrying either a full Kubernetes manifest or a `{namespace, name}`
//! reference.

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    CreatePod,
    CreatePvc,
    DeletePod,
    DeletePvc,
    AgentTask,
}

impl TaskType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreatePod => "CreatePod",
            Self::CreatePvc => "CreatePvc",
            Self::DeletePod => "DeletePod",
            Self::DeletePvc => "DeletePvc",
            Self::AgentTask => "AgentTask",
        }
    }

    /// Whether the task creates a Kubernetes object.
    #[must_use]
    pub const fn is_creation(self) -> bool {
        matches!(self, Self::CreatePod | Self::CreatePvc)
    }

    /// Whether the task deletes a Kubernetes object.
    #[must_use]
    pub const fn is_deletion(self) -> bool {
        matches!(self, Self::DeletePod | Self::DeletePvc)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task metadata shared by every task type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the control plane created the task.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub account: String,
    /// Runtime (cluster) the task targets.
    pub re_name: String,
    /// Workflow the task belongs to, empty for legacy tasks.
    #[serde(default)]
    pub workflow: String,
}

/// Reference to an existing namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Spec of an `AgentTask`: work the agent performs itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Decoded task payload, one variant per [`TaskType`].
#[derive(Debug, Clone, PartialEq)]
pub enum TaskSpec {
    CreatePod(Box<Pod>),
    CreatePvc(Box<PersistentVolumeClaim>),
    DeletePod(ResourceRef),
    DeletePvc(ResourceRef),
    Agent(AgentTaskSpec),
}

/// A unit of work pulled from the control plane.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawTask")]
pub struct Task {
    pub spec: TaskSpec,
    pub metadata: Metadata,
}

impl Task {
    #[must_use]
    pub fn new(spec: TaskSpec, metadata: Metadata) -> Self {
        Self { spec, metadata }
    }

    #[must_use]
    pub fn task_type(&self) -> TaskType {
        match &self.spec {
            TaskSpec::CreatePod(_) => TaskType::CreatePod,
            TaskSpec::CreatePvc(_) => TaskType::CreatePvc,
            TaskSpec::DeletePod(_) => TaskType::DeletePod,
            TaskSpec::DeletePvc(_) => TaskType::DeletePvc,
            TaskSpec::Agent(_) => TaskType::AgentTask,
        }
    }

    /// Human readable target of the task, used in logs.
    #[must_use]
    pub fn target(&self) -> String {
        fn object(namespace: Option<&String>, name: Option<&String>) -> String {
            format!(
                "{}/{}",
                namespace.map_or("", String::as_str),
                name.map_or("", String::as_str)
            )
        }

        match &self.spec {
            TaskSpec::CreatePod(pod) => {
                object(pod.metadata.namespace.as_ref(), pod.metadata.name.as_ref())
            }
            TaskSpec::CreatePvc(pvc) => {
                object(pvc.metadata.namespace.as_ref(), pvc.metadata.name.as_ref())
            }
            TaskSpec::DeletePod(r) | TaskSpec::DeletePvc(r) => r.to_string(),
            TaskSpec::Agent(spec) => spec.kind.clone(),
        }
    }
}

/// Wire envelope, before the spec is interpreted.
#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    spec: Value,
    metadata: Metadata,
}

impl TryFrom<RawTask> for Task {
    type Error = DecodeError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        let task_type = raw.task_type;
        let wrap = |source| DecodeError::Spec { task_type, source };

        let spec = match task_type {
            TaskType::CreatePod => TaskSpec::CreatePod(decode_spec(raw.spec).map_err(wrap)?),
            TaskType::CreatePvc => TaskSpec::CreatePvc(decode_spec(raw.spec).map_err(wrap)?),
            TaskType::DeletePod => TaskSpec::DeletePod(decode_spec(raw.spec).map_err(wrap)?),
            TaskType::DeletePvc => TaskSpec::DeletePvc(decode_spec(raw.spec).map_err(wrap)?),
            TaskType::AgentTask => TaskSpec::Agent(decode_spec(raw.spec).map_err(wrap)?),
        };

        Ok(Self {
            spec,
            metadata: raw.metadata,
        })
    }
}

/// Decode a single task from its JSON value.
pub fn decode_task(value: Value) -> Result<Task, DecodeError> {
    let raw: RawTask = serde_json::from_value(value)?;
    Task::try_from(raw)
}

/// Specs are sometimes shipped as a JSON document encoded in a string.
fn decode_spec<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    match value {
        Value::String(encoded) => serde_json::from_str(&encoded),
        other => serde_json::from_value(other),
    }
}
