//! The agent: polls the control plane for tasks and reports health.
//!
//! Two independent fixed-rate loops run once the agent is started. The poll
//! loop fetches tasks, splits them by category, groups workflow tasks by
//! workflow id and feeds them to the [`WorkflowQueue`]; agent tasks are run
//! straight away. The report loop pushes a health status. A slow cycle drops
//! the ticks it overran rather than queueing them.
//!
//! Enqueueing waits for buffer space, so a workflow whose buffer is full holds
//! up the poll loop, and with it every later batch, until its worker drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use codefresh::{AgentStatus, Codefresh, Task, TaskSpec};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::agent_task::AgentTaskExecutor;
use crate::error::AgentError;
use crate::queue::{QueueOptions, TaskReport, WorkflowQueue, DEFAULT_BUFFER_SIZE};
use crate::runtime::Runtime;
use crate::workflow::{build_workflows, group_tasks, split_by_category, Categorized};

pub const DEFAULT_TASK_PULLING_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_STATUS_REPORTING_INTERVAL: Duration = Duration::from_secs(10);

/// Everything an [`Agent`] depends on.
pub struct AgentOptions {
    pub id: String,
    pub codefresh: Arc<dyn Codefresh>,
    /// Executors by runtime name.
    pub runtimes: HashMap<String, Arc<dyn Runtime>>,
    pub task_pulling_interval: Duration,
    pub status_reporting_interval: Duration,
    /// Per-workflow channel capacity.
    pub buffer_size: usize,
    pub task_timeout: Option<Duration>,
    /// Agent task executor, a default one is built when `None`.
    pub agent_tasks: Option<AgentTaskExecutor>,
    /// Receives the outcome of every workflow task.
    pub reporter: Option<mpsc::UnboundedSender<TaskReport>>,
}

impl AgentOptions {
    /// Options with default intervals and buffer size.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        codefresh: Arc<dyn Codefresh>,
        runtimes: HashMap<String, Arc<dyn Runtime>>,
    ) -> Self {
        Self {
            id: id.into(),
            codefresh,
            runtimes,
            task_pulling_interval: DEFAULT_TASK_PULLING_INTERVAL,
            status_reporting_interval: DEFAULT_STATUS_REPORTING_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            task_timeout: None,
            agent_tasks: None,
            reporter: None,
        }
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.id.is_empty() {
            return Err(AgentError::InvalidOptions("agent id is empty".to_string()));
        }
        if self.runtimes.is_empty() {
            return Err(AgentError::InvalidOptions(
                "no runtimes configured".to_string(),
            ));
        }
        if self.task_pulling_interval.is_zero() || self.status_reporting_interval.is_zero() {
            return Err(AgentError::InvalidOptions(
                "intervals must be greater than zero".to_string(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(AgentError::InvalidOptions(
                "buffer size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Last known health of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub message: String,
    pub time: DateTime<Utc>,
}

struct Inner {
    id: String,
    codefresh: Arc<dyn Codefresh>,
    queue: WorkflowQueue,
    agent_tasks: AgentTaskExecutor,
    in_flight: TaskTracker,
    running: AtomicBool,
    status: RwLock<Status>,
    task_pulling_interval: Duration,
    status_reporting_interval: Duration,
}

/// Long-running agent. See the module docs.
pub struct Agent {
    inner: Arc<Inner>,
    loops: Mutex<Option<[JoinHandle<()>; 2]>>,
}

impl Agent {
    /// Build an agent from validated options. Nothing runs until
    /// [`start`](Self::start).
    ///
    /// # Errors
    /// Returns [`AgentError::InvalidOptions`] when the options are incomplete.
    pub fn new(opts: AgentOptions) -> Result<Self, AgentError> {
        opts.validate()?;

        let agent_tasks = match opts.agent_tasks {
            Some(executor) => executor,
            None => AgentTaskExecutor::new()
                .map_err(|e| AgentError::InvalidOptions(e.to_string()))?,
        };

        let queue = WorkflowQueue::new(QueueOptions {
            runtimes: opts.runtimes,
            buffer_size: opts.buffer_size,
            task_timeout: opts.task_timeout,
            reporter: opts.reporter,
        });

        Ok(Self {
            inner: Arc::new(Inner {
                id: opts.id,
                codefresh: opts.codefresh,
                queue,
                agent_tasks,
                in_flight: TaskTracker::new(),
                running: AtomicBool::new(false),
                status: RwLock::new(Status {
                    message: "Not reported yet".to_string(),
                    time: Utc::now(),
                }),
                task_pulling_interval: opts.task_pulling_interval,
                status_reporting_interval: opts.status_reporting_interval,
            }),
            loops: Mutex::new(None),
        })
    }

    /// Start polling and reporting. Returns immediately.
    ///
    /// # Errors
    /// Returns [`AgentError::AlreadyStarted`] if the agent is running.
    pub fn start(&self) -> Result<(), AgentError> {
        self.inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::AlreadyStarted)?;

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        if loops.is_none() {
            *loops = Some([
                tokio::spawn(poll_loop(Arc::clone(&self.inner))),
                tokio::spawn(report_loop(Arc::clone(&self.inner))),
            ]);
        }

        info!(
            agent_id = %self.inner.id,
            task_pulling_interval = ?self.inner.task_pulling_interval,
            status_reporting_interval = ?self.inner.status_reporting_interval,
            "Agent started"
        );
        Ok(())
    }

    /// Stop issuing new polls and reports. In-flight work is not cancelled.
    ///
    /// # Errors
    /// Returns [`AgentError::AlreadyStopped`] if the agent is not running.
    pub fn stop(&self) -> Result<(), AgentError> {
        self.inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AgentError::AlreadyStopped)?;
        info!(agent_id = %self.inner.id, "Agent stopped");
        Ok(())
    }

    /// Wait for queued workflow tasks and in-flight agent tasks.
    pub async fn wait(&self) {
        self.inner.queue.wait().await;
        self.inner.in_flight.close();
        self.inner.in_flight.wait().await;
        self.inner.in_flight.reopen();
    }

    /// Last status successfully reported to the control plane.
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Run a single poll cycle regardless of the timer.
    pub async fn poll_once(&self) {
        self.inner.poll_once().await;
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let loops = self.loops.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handles) = loops.take() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

async fn poll_loop(inner: Arc<Inner>) {
    let mut ticker = interval(inner.task_pulling_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if inner.running.load(Ordering::Acquire) {
            inner.poll_once().await;
        }
    }
}

async fn report_loop(inner: Arc<Inner>) {
    let mut ticker = interval(inner.status_reporting_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if inner.running.load(Ordering::Acquire) {
            inner.report_once().await;
        }
    }
}

impl Inner {
    async fn poll_once(&self) {
        let tasks = match self.codefresh.tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Failed fetching tasks");
                return;
            }
        };

        let pulled = tasks.len();
        let categorized = split_by_category(tasks);
        if categorized.is_empty() {
            debug!(pending = self.queue.pending(), "No tasks pulled");
            return;
        }
        let Categorized {
            creation,
            deletion,
            agent,
        } = categorized;

        let agent_tasks = agent.len();
        for task in agent {
            self.spawn_agent_task(task);
        }

        let (creation, mut rejected) = build_workflows(group_tasks(creation));
        let (deletion, rejected_deletion) = build_workflows(group_tasks(deletion));
        rejected.extend(rejected_deletion);
        for e in &rejected {
            error!(error = %e, "Dropping task that does not belong to its workflow");
        }

        let workflows = creation.len() + deletion.len();
        for workflow in creation.into_iter().chain(deletion) {
            debug!(
                workflow = %workflow.key(),
                kind = workflow.kind.as_str(),
                tasks = workflow.len(),
                "Enqueueing workflow"
            );
            for task in workflow.tasks {
                self.queue.enqueue(task).await;
            }
        }

        info!(
            pulled,
            agent_tasks,
            workflows,
            dropped = rejected.len(),
            pending = self.queue.pending(),
            workers = self.queue.workers(),
            "Done handling tasks"
        );
    }

    fn spawn_agent_task(&self, task: Task) {
        let TaskSpec::Agent(spec) = task.spec else {
            return;
        };
        let executor = self.agent_tasks.clone();
        self.in_flight.spawn(async move {
            match executor.execute(&spec).await {
                Ok(()) => debug!(kind = %spec.kind, "Agent task done"),
                Err(e) => error!(kind = %spec.kind, error = %e, "Failed executing agent task"),
            }
        });
    }

    async fn report_once(&self) {
        let status = AgentStatus::healthy();
        match self.codefresh.report_status(&status).await {
            Ok(()) => {
                let mut current = self.status.write().unwrap_or_else(PoisonError::into_inner);
                *current = Status {
                    message: status.message,
                    time: Utc::now(),
                };
            }
            Err(e) => error!(error = %e, "Failed reporting status"),
        }
    }
}
