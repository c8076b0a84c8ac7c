//! Runtime executors.

use std::sync::Arc;

use async_trait::async_trait;
use codefresh::{Task, TaskSpec};
use tracing::debug;

use crate::error::RuntimeError;
use crate::kubernetes::{Cluster, ClusterError};

/// Executes tasks against one runtime environment.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Realize `task`. Returning an error never stops the caller.
    async fn handle_task(&self, task: &Task) -> Result<(), RuntimeError>;
}

/// Runtime backed by a Kubernetes cluster.
///
/// Creating an object that already exists and deleting one that is already
/// gone both count as success, so re-delivered tasks are harmless.
#[derive(Clone)]
pub struct KubernetesRuntime {
    cluster: Arc<dyn Cluster>,
}

impl KubernetesRuntime {
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Runtime for KubernetesRuntime {
    async fn handle_task(&self, task: &Task) -> Result<(), RuntimeError> {
        let result = match &task.spec {
            TaskSpec::CreatePod(pod) => match self.cluster.create_pod(pod).await {
                Err(ClusterError::AlreadyExists) => {
                    debug!(target_object = %task.target(), "Pod already exists");
                    Ok(())
                }
                other => other,
            },
            TaskSpec::CreatePvc(pvc) => match self.cluster.create_pvc(pvc).await {
                Err(ClusterError::AlreadyExists) => {
                    debug!(target_object = %task.target(), "PVC already exists");
                    Ok(())
                }
                other => other,
            },
            TaskSpec::DeletePod(target) => match self.cluster.delete_pod(target).await {
                Err(ClusterError::NotFound) => {
                    debug!(target_object = %target, "Pod already deleted");
                    Ok(())
                }
                other => other,
            },
            TaskSpec::DeletePvc(target) => match self.cluster.delete_pvc(target).await {
                Err(ClusterError::NotFound) => {
                    debug!(target_object = %target, "PVC already deleted");
                    Ok(())
                }
                other => other,
            },
            TaskSpec::Agent(_) => return Err(RuntimeError::Unsupported(task.task_type())),
        };

        result.map_err(|source| RuntimeError::TaskExecution {
            task_type: task.task_type(),
            target: task.target(),
            source,
        })
    }
}
