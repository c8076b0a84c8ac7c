//! Kubernetes cluster access.
//!
//! [`Cluster`] is the narrow surface the runtime executor needs: create and
//! delete pods and PVCs. [`KubeCluster`] implements it on top of `kube`,
//! either with the in-cluster service account or with a remote runtime
//! described by a [`RuntimeConfig`].

use std::time::Instant;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use codefresh::ResourceRef;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Error as KubeError};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RuntimeConfig;

/// The only runtime config type a client can be built from.
pub const RUNTIME_CONFIG_TYPE: &str = "runtime";

/// Namespace used when neither the manifest nor the caller names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Errors from cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("object already exists")]
    AlreadyExists,

    #[error("object not found")]
    NotFound,

    #[error("Kubernetes API error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("Kubernetes client error: {0}")]
    Kube(#[source] KubeError),

    #[error("invalid cluster configuration: {0}")]
    Config(String),
}

impl From<KubeError> for ClusterError {
    fn from(err: KubeError) -> Self {
        match err {
            KubeError::Api(resp) => match resp.code {
                409 => Self::AlreadyExists,
                404 | 410 => Self::NotFound,
                code => Self::Api {
                    code,
                    reason: resp.reason,
                    message: resp.message,
                },
            },
            other => Self::Kube(other),
        }
    }
}

/// Operations the runtime executor performs against a cluster.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError>;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError>;

    async fn delete_pod(&self, target: &ResourceRef) -> Result<(), ClusterError>;

    async fn delete_pvc(&self, target: &ResourceRef) -> Result<(), ClusterError>;
}

/// `kube` backed [`Cluster`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    force_delete_pvc: bool,
}

impl KubeCluster {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>, force_delete_pvc: bool) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            force_delete_pvc,
        }
    }

    /// Client for the cluster the agent runs in.
    ///
    /// # Errors
    /// Returns error if the service account environment is missing or the
    /// client cannot be built.
    pub fn in_cluster(force_delete_pvc: bool) -> Result<Self, ClusterError> {
        let config = Config::incluster().map_err(|e| ClusterError::Config(e.to_string()))?;
        let namespace = config.default_namespace.clone();
        let client = Client::try_from(config).map_err(ClusterError::Kube)?;
        info!(namespace = %namespace, "Using in-cluster Kubernetes runtime");
        Ok(Self::new(client, namespace, force_delete_pvc))
    }

    /// Client for a remote runtime.
    ///
    /// # Errors
    /// Returns error if the config type is not `runtime` or the generated
    /// kubeconfig is rejected.
    pub async fn remote(
        config: &RuntimeConfig,
        insecure: bool,
        force_delete_pvc: bool,
    ) -> Result<Self, ClusterError> {
        if config.kind != RUNTIME_CONFIG_TYPE {
            return Err(ClusterError::Config(format!(
                "unsupported runtime config type \"{}\"",
                config.kind
            )));
        }

        let kubeconfig = remote_kubeconfig(config, insecure)?;
        let kube_config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?;
        let client = Client::try_from(kube_config).map_err(ClusterError::Kube)?;

        Ok(Self::new(client, DEFAULT_NAMESPACE, force_delete_pvc))
    }

    fn namespace_or_default<'a>(&'a self, namespace: Option<&'a String>) -> &'a str {
        namespace
            .map(String::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(self.namespace.as_str())
    }

    async fn remove_pvc_finalizers(
        &self,
        api: &Api<PersistentVolumeClaim>,
        name: &str,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "metadata": { "finalizers": null } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(ClusterError::from)
        {
            Ok(_) | Err(ClusterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Render a single-context kubeconfig for a remote runtime.
fn remote_kubeconfig(config: &RuntimeConfig, insecure: bool) -> Result<Kubeconfig, ClusterError> {
    let mut cluster = serde_json::Map::new();
    cluster.insert("server".to_string(), json!(config.host));
    if insecure || config.crt.is_empty() {
        cluster.insert("insecure-skip-tls-verify".to_string(), json!(true));
    } else {
        cluster.insert(
            "certificate-authority-data".to_string(),
            json!(STANDARD.encode(config.crt.as_bytes())),
        );
    }

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": config.name, "cluster": cluster }],
        "users": [{ "name": config.name, "user": { "token": config.token } }],
        "contexts": [{
            "name": config.name,
            "context": { "cluster": config.name, "user": config.name }
        }],
        "current-context": config.name,
    });

    let yaml = serde_yaml::to_string(&document).map_err(|e| ClusterError::Config(e.to_string()))?;
    Kubeconfig::from_yaml(&yaml).map_err(|e| ClusterError::Config(e.to_string()))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let started = Instant::now();
        let namespace = self.namespace_or_default(pod.metadata.namespace.as_ref());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        api.create(&PostParams::default(), pod).await?;

        info!(
            kind = "Pod",
            namespace = %namespace,
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            processing_time_ms = started.elapsed().as_millis(),
            "Done handling k8s task"
        );
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let started = Instant::now();
        let namespace = self.namespace_or_default(pvc.metadata.namespace.as_ref());
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        api.create(&PostParams::default(), pvc).await?;

        info!(
            kind = "PersistentVolumeClaim",
            namespace = %namespace,
            name = pvc.metadata.name.as_deref().unwrap_or_default(),
            processing_time_ms = started.elapsed().as_millis(),
            "Done handling k8s task"
        );
        Ok(())
    }

    async fn delete_pod(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let started = Instant::now();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        api.delete(&target.name, &DeleteParams::default()).await?;

        info!(
            kind = "Pod",
            namespace = %target.namespace,
            name = %target.name,
            processing_time_ms = started.elapsed().as_millis(),
            "Done handling k8s task"
        );
        Ok(())
    }

    async fn delete_pvc(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        let started = Instant::now();
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &target.namespace);

        api.delete(&target.name, &DeleteParams::default()).await?;

        if self.force_delete_pvc {
            debug!(pvc = %target, "Removing PVC finalizers");
            self.remove_pvc_finalizers(&api, &target.name).await?;
        }

        info!(
            kind = "PersistentVolumeClaim",
            namespace = %target.namespace,
            name = %target.name,
            processing_time_ms = started.elapsed().as_millis(),
            "Done handling k8s task"
        );
        Ok(())
    }
}
