//! Per-workflow task queue.
//!
//! Every workflow key owns a bounded channel drained by exactly one worker,
//! so tasks of the same workflow run strictly in enqueue order while
//! unrelated workflows progress concurrently. A task that blocks only ever
//! stalls its own key.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use codefresh::{Task, TaskType};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::TaskError;
use crate::runtime::Runtime;
use crate::workflow::group_key;

/// Default per-workflow channel capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 20;

/// Outcome of one processed task, published when a reporter is configured.
#[derive(Debug)]
pub struct TaskReport {
    pub key: String,
    pub re_name: String,
    pub task_type: TaskType,
    pub target: String,
    pub result: Result<(), TaskError>,
}

/// Construction options for [`WorkflowQueue`].
#[derive(Clone)]
pub struct QueueOptions {
    /// Executors by runtime name (`reName`).
    pub runtimes: HashMap<String, Arc<dyn Runtime>>,
    /// Capacity of each workflow's channel.
    pub buffer_size: usize,
    /// Upper bound for a single `handle_task` call.
    pub task_timeout: Option<Duration>,
    pub reporter: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            runtimes: HashMap::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            task_timeout: None,
            reporter: None,
        }
    }
}

/// State shared by the queue handle and its workers.
struct Shared {
    runtimes: HashMap<String, Arc<dyn Runtime>>,
    task_timeout: Option<Duration>,
    reporter: Option<mpsc::UnboundedSender<TaskReport>>,
    outstanding: watch::Sender<usize>,
}

/// Ordered-per-workflow, concurrent-across-workflows task queue.
#[derive(Clone)]
pub struct WorkflowQueue {
    shared: Arc<Shared>,
    workers: Arc<Mutex<HashMap<String, mpsc::Sender<Task>>>>,
    buffer_size: usize,
}

impl WorkflowQueue {
    #[must_use]
    pub fn new(opts: QueueOptions) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                runtimes: opts.runtimes,
                task_timeout: opts.task_timeout,
                reporter: opts.reporter,
                outstanding,
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
            buffer_size: opts.buffer_size.max(1),
        }
    }

    /// Hand `task` to its workflow's worker.
    ///
    /// Never fails. Suspends while that workflow's channel is full; other
    /// workflows are unaffected.
    pub async fn enqueue(&self, task: Task) {
        let key = group_key(&task.metadata).to_string();
        let sender = self.sender_for(&key);

        self.shared.outstanding.send_modify(|n| *n += 1);
        if let Err(e) = sender.send(task).await {
            // Only happens when the tokio runtime tears the worker down.
            error!(
                workflow = %key,
                task_type = %e.0.task_type(),
                "Workflow worker is gone, dropping task"
            );
            self.shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Resolve once every task enqueued so far has finished.
    pub async fn wait(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Tasks enqueued but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Number of workflow workers spawned so far.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sender of `key`'s worker, spawning it on first use.
    fn sender_for(&self, key: &str) -> mpsc::Sender<Task> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = workers.get(key) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        tokio::spawn(run_worker(key.to_string(), rx, Arc::clone(&self.shared)));
        workers.insert(key.to_string(), tx.clone());
        debug!(workflow = %key, workers = workers.len(), "Started workflow worker");
        tx
    }
}

async fn run_worker(key: String, mut rx: mpsc::Receiver<Task>, shared: Arc<Shared>) {
    while let Some(task) = rx.recv().await {
        let started = Instant::now();
        let result = shared.process(&task).await;

        match &result {
            Ok(()) => info!(
                workflow = %key,
                re_name = %task.metadata.re_name,
                task_type = %task.task_type(),
                target_object = %task.target(),
                elapsed_ms = started.elapsed().as_millis(),
                "Task handled"
            ),
            Err(e) => error!(
                workflow = %key,
                re_name = %task.metadata.re_name,
                task_type = %task.task_type(),
                target_object = %task.target(),
                error = %e,
                "Failed handling task"
            ),
        }

        if let Some(reporter) = &shared.reporter {
            let _ = reporter.send(TaskReport {
                key: key.clone(),
                re_name: task.metadata.re_name.clone(),
                task_type: task.task_type(),
                target: task.target(),
                result,
            });
        }

        shared.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
    debug!(workflow = %key, "Workflow worker stopped");
}

impl Shared {
    async fn process(&self, task: &Task) -> Result<(), TaskError> {
        let Some(runtime) = self.runtimes.get(&task.metadata.re_name) else {
            return Err(TaskError::UnknownExecutor {
                re_name: task.metadata.re_name.clone(),
            });
        };

        let handled = AssertUnwindSafe(runtime.handle_task(task)).catch_unwind();
        let outcome = match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, handled)
                .await
                .map_err(|_| TaskError::Timeout(limit))?,
            None => handled.await,
        };

        match outcome {
            Ok(result) => result.map_err(TaskError::from),
            Err(_) => Err(TaskError::Panicked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use async_trait::async_trait;
    use chrono::Utc;
    use codefresh::{Metadata, ResourceRef, TaskSpec};

    /// Runtime that records targets and misbehaves on request.
    #[derive(Default)]
    struct RecordingRuntime {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Runtime for RecordingRuntime {
        async fn handle_task(&self, task: &Task) -> Result<(), RuntimeError> {
            let target = task.target();
            match target.as_str() {
                "ns/panic" => panic!("runtime exploded"),
                "ns/slow" => tokio::time::sleep(Duration::from_secs(5)).await,
                _ => tokio::time::sleep(Duration::from_millis(2)).await,
            }
            self.seen.lock().unwrap().push(target);
            Ok(())
        }
    }

    fn task(workflow: &str, re_name: &str, name: &str) -> Task {
        Task::new(
            TaskSpec::DeletePod(ResourceRef {
                namespace: "ns".to_string(),
                name: name.to_string(),
            }),
            Metadata {
                created_at: Utc::now(),
                account: String::new(),
                re_name: re_name.to_string(),
                workflow: workflow.to_string(),
            },
        )
    }

    fn queue(
        runtime: Arc<RecordingRuntime>,
        task_timeout: Option<Duration>,
    ) -> (WorkflowQueue, mpsc::UnboundedReceiver<TaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut runtimes: HashMap<String, Arc<dyn Runtime>> = HashMap::new();
        runtimes.insert("rt".to_string(), runtime);
        let queue = WorkflowQueue::new(QueueOptions {
            runtimes,
            buffer_size: 4,
            task_timeout,
            reporter: Some(tx),
        });
        (queue, rx)
    }

    #[tokio::test]
    async fn test_same_workflow_runs_in_order() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (queue, _reports) = queue(runtime.clone(), None);

        for i in 0..10 {
            queue.enqueue(task("wf1", "rt", &i.to_string())).await;
        }
        queue.wait().await;

        let expected: Vec<String> = (0..10).map(|i| format!("ns/{i}")).collect();
        assert_eq!(*runtime.seen.lock().unwrap(), expected);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.workers(), 1);
    }

    #[tokio::test]
    async fn test_one_worker_per_key() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (queue, _reports) = queue(runtime, None);

        queue.enqueue(task("wf1", "rt", "a")).await;
        queue.enqueue(task("wf2", "rt", "b")).await;
        queue.enqueue(task("", "rt", "c")).await;
        queue.enqueue(task("wf1", "rt", "d")).await;
        queue.wait().await;

        assert_eq!(queue.workers(), 3);
    }

    #[tokio::test]
    async fn test_unknown_executor_is_reported() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (queue, mut reports) = queue(runtime.clone(), None);

        queue.enqueue(task("wf1", "missing", "a")).await;
        queue.enqueue(task("wf1", "rt", "b")).await;
        queue.wait().await;

        let first = reports.recv().await.unwrap();
        assert!(matches!(
            first.result,
            Err(TaskError::UnknownExecutor { ref re_name }) if re_name == "missing"
        ));
        assert!(reports.recv().await.unwrap().result.is_ok());
        assert_eq!(*runtime.seen.lock().unwrap(), vec!["ns/b"]);
    }

    #[tokio::test]
    async fn test_panic_does_not_kill_worker() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (queue, mut reports) = queue(runtime.clone(), None);

        queue.enqueue(task("wf1", "rt", "panic")).await;
        queue.enqueue(task("wf1", "rt", "after")).await;
        queue.wait().await;

        assert!(matches!(
            reports.recv().await.unwrap().result,
            Err(TaskError::Panicked)
        ));
        assert_eq!(*runtime.seen.lock().unwrap(), vec!["ns/after"]);
    }

    #[tokio::test]
    async fn test_timeout_releases_the_workflow() {
        let runtime = Arc::new(RecordingRuntime::default());
        let (queue, mut reports) = queue(runtime.clone(), Some(Duration::from_millis(100)));

        queue.enqueue(task("wf1", "rt", "slow")).await;
        queue.enqueue(task("wf1", "rt", "next")).await;
        queue.wait().await;

        assert!(matches!(
            reports.recv().await.unwrap().result,
            Err(TaskError::Timeout(_))
        ));
        assert_eq!(*runtime.seen.lock().unwrap(), vec!["ns/next"]);
    }

    #[tokio::test]
    async fn test_wait_on_empty_queue_returns() {
        let (queue, _reports) = queue(Arc::new(RecordingRuntime::default()), None);
        queue.wait().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.workers(), 0);
    }
}
