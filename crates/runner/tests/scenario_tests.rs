//! End-to-end runs from a pulled batch to cluster state.

mod support;

use std::sync::Arc;
use std::time::Duration;

use runner::{Agent, AgentOptions, TaskReport};
use support::{
    create_pod, create_pvc, delete_pod, delete_pvc, runtimes, FakeCluster, FakeCodefresh,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const RE_NAME: &str = "rt";

fn agent(
    codefresh: Arc<FakeCodefresh>,
    cluster: Arc<FakeCluster>,
) -> (Agent, mpsc::UnboundedReceiver<TaskReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut opts = AgentOptions::new("agent-1", codefresh, runtimes(RE_NAME, cluster));
    opts.reporter = Some(tx);
    (Agent::new(opts).unwrap(), rx)
}

#[tokio::test]
async fn test_create_then_delete_in_one_workflow() {
    let codefresh = FakeCodefresh::new();
    let cluster = FakeCluster::new();
    codefresh.push_batch(vec![
        create_pod("wf1", RE_NAME, "pod1"),
        create_pod("wf1", RE_NAME, "pod2"),
        delete_pod("wf1", RE_NAME, "pod1"),
    ]);
    let (agent, _reports) = agent(codefresh, cluster.clone());

    agent.poll_once().await;
    agent.wait().await;

    assert!(!cluster.contains("Pod", "ns", "pod1"));
    assert!(cluster.contains("Pod", "ns", "pod2"));
    assert_eq!(
        cluster.log(),
        vec![
            "create_pod ns/pod1",
            "create_pod ns/pod2",
            "delete_pod ns/pod1"
        ]
    );
}

#[tokio::test]
async fn test_creation_runs_before_deletion_of_same_workflow() {
    let codefresh = FakeCodefresh::new();
    let cluster = FakeCluster::new();
    codefresh.push_batch(vec![
        delete_pvc("wf1", RE_NAME, "cache"),
        create_pvc("wf1", RE_NAME, "cache"),
    ]);
    let (agent, _reports) = agent(codefresh, cluster.clone());

    agent.poll_once().await;
    agent.wait().await;

    assert_eq!(
        cluster.log(),
        vec!["create_pvc ns/cache", "delete_pvc ns/cache"]
    );
    assert!(!cluster.contains("Pvc", "ns", "cache"));
}

#[tokio::test]
async fn test_delete_of_missing_object_succeeds() {
    let codefresh = FakeCodefresh::new();
    let cluster = FakeCluster::new();
    codefresh.push_batch(vec![delete_pod("wf1", RE_NAME, "ghost")]);
    let (agent, mut reports) = agent(codefresh, cluster.clone());

    agent.poll_once().await;
    agent.wait().await;

    let report = reports.recv().await.unwrap();
    assert!(report.result.is_ok(), "unexpected failure: {:?}", report.result);
    assert_eq!(cluster.log(), vec!["delete_pod ns/ghost"]);
}

#[tokio::test]
async fn test_unknown_runtime_then_known_runtime() {
    let codefresh = FakeCodefresh::new();
    let cluster = FakeCluster::new();
    codefresh.push_batch(vec![create_pod("wf1", "other-runtime", "a")]);
    codefresh.push_batch(vec![create_pod("wf1", RE_NAME, "b")]);
    let (agent, mut reports) = agent(codefresh, cluster.clone());

    agent.poll_once().await;
    agent.poll_once().await;
    agent.wait().await;

    let first = reports.recv().await.unwrap();
    assert!(matches!(
        first.result,
        Err(runner::TaskError::UnknownExecutor { .. })
    ));
    assert!(reports.recv().await.unwrap().result.is_ok());
    assert!(cluster.contains("Pod", "ns", "b"));
}

#[tokio::test]
async fn test_mismatching_runtime_in_workflow_is_dropped() {
    let codefresh = FakeCodefresh::new();
    let cluster = FakeCluster::new();
    codefresh.push_batch(vec![
        create_pod("wf1", RE_NAME, "kept"),
        create_pod("wf1", "other-runtime", "dropped"),
    ]);
    let (agent, mut reports) = agent(codefresh, cluster.clone());

    agent.poll_once().await;
    agent.wait().await;

    assert!(reports.recv().await.unwrap().result.is_ok());
    assert!(
        timeout(Duration::from_millis(50), reports.recv()).await.is_err(),
        "the mismatching task must never reach the queue"
    );
    assert_eq!(cluster.log(), vec!["create_pod ns/kept"]);
}
