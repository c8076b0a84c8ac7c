//! In-memory stand-ins for the cluster and the control plane.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use codefresh::{
    AgentStatus, Codefresh, CodefreshError, Metadata, ResourceRef, Task, TaskSpec,
};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use runner::{Cluster, ClusterError, KubernetesRuntime, Runtime};
use tokio::sync::Notify;

/// Cluster keeping objects in memory.
///
/// Every call is appended to `log` as `"<op> <namespace>/<name>"`. A call on
/// a gated name blocks until [`FakeCluster::release`] is called for it.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashSet<String>>,
    log: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block calls on objects named `name` until released.
    pub fn gate(&self, name: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, name: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(name) {
            gate.notify_one();
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains(&format!("{kind}/{namespace}/{name}"))
    }

    async fn pass_gate(&self, name: &str) {
        let gate = self.gates.lock().unwrap().get(name).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    async fn create(&self, op: &str, kind: &str, meta: &ObjectMeta) -> Result<(), ClusterError> {
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        self.pass_gate(&name).await;
        self.log.lock().unwrap().push(format!("{op} {namespace}/{name}"));
        if self
            .objects
            .lock()
            .unwrap()
            .insert(format!("{kind}/{namespace}/{name}"))
        {
            Ok(())
        } else {
            Err(ClusterError::AlreadyExists)
        }
    }

    async fn delete(&self, op: &str, kind: &str, target: &ResourceRef) -> Result<(), ClusterError> {
        self.pass_gate(&target.name).await;
        self.log.lock().unwrap().push(format!("{op} {target}"));
        if self
            .objects
            .lock()
            .unwrap()
            .remove(&format!("{kind}/{}/{}", target.namespace, target.name))
        {
            Ok(())
        } else {
            Err(ClusterError::NotFound)
        }
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        self.create("create_pod", "Pod", &pod.metadata).await
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        self.create("create_pvc", "Pvc", &pvc.metadata).await
    }

    async fn delete_pod(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.delete("delete_pod", "Pod", target).await
    }

    async fn delete_pvc(&self, target: &ResourceRef) -> Result<(), ClusterError> {
        self.delete("delete_pvc", "Pvc", target).await
    }
}

/// Runtime table with a single Kubernetes runtime named `re_name`.
pub fn runtimes(re_name: &str, cluster: Arc<FakeCluster>) -> HashMap<String, Arc<dyn Runtime>> {
    let mut runtimes: HashMap<String, Arc<dyn Runtime>> = HashMap::new();
    runtimes.insert(
        re_name.to_string(),
        Arc::new(KubernetesRuntime::new(cluster)),
    );
    runtimes
}

pub fn metadata(workflow: &str, re_name: &str, offset_secs: i64) -> Metadata {
    Metadata {
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
            + ChronoDuration::seconds(offset_secs),
        account: "account".to_string(),
        re_name: re_name.to_string(),
        workflow: workflow.to_string(),
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

fn reference(namespace: &str, name: &str) -> ResourceRef {
    ResourceRef {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

pub fn create_pod(workflow: &str, re_name: &str, name: &str) -> Task {
    let pod = Pod {
        metadata: object_meta("ns", name),
        ..Pod::default()
    };
    Task::new(TaskSpec::CreatePod(Box::new(pod)), metadata(workflow, re_name, 0))
}

pub fn create_pvc(workflow: &str, re_name: &str, name: &str) -> Task {
    let pvc = PersistentVolumeClaim {
        metadata: object_meta("ns", name),
        ..PersistentVolumeClaim::default()
    };
    Task::new(TaskSpec::CreatePvc(Box::new(pvc)), metadata(workflow, re_name, 0))
}

pub fn delete_pod(workflow: &str, re_name: &str, name: &str) -> Task {
    Task::new(
        TaskSpec::DeletePod(reference("ns", name)),
        metadata(workflow, re_name, 1),
    )
}

pub fn delete_pvc(workflow: &str, re_name: &str, name: &str) -> Task {
    Task::new(
        TaskSpec::DeletePvc(reference("ns", name)),
        metadata(workflow, re_name, 1),
    )
}

/// Control plane serving scripted task batches.
#[derive(Default)]
pub struct FakeCodefresh {
    batches: Mutex<VecDeque<Vec<Task>>>,
    polls: AtomicUsize,
    reports: AtomicUsize,
    fail: AtomicBool,
}

impl FakeCodefresh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `tasks` on the next poll.
    pub fn push_batch(&self, tasks: Vec<Task>) {
        self.batches.lock().unwrap().push_back(tasks);
    }

    /// Make every call fail with a 500.
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }

    fn server_error() -> CodefreshError {
        CodefreshError::Network {
            status: 500,
            body: "internal error".to_string(),
        }
    }
}

#[async_trait]
impl Codefresh for FakeCodefresh {
    async fn tasks(&self) -> Result<Vec<Task>, CodefreshError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn report_status(&self, _status: &AgentStatus) -> Result<(), CodefreshError> {
        self.reports.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }
        Ok(())
    }

    fn host(&self) -> &str {
        "http://fake"
    }
}
