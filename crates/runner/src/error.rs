//! Error types for the runner agent core.

use std::time::Duration;

use codefresh::TaskType;
use thiserror::Error;

use crate::kubernetes::ClusterError;

/// Errors returned by [`Agent`](crate::Agent) lifecycle calls.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent already running")]
    AlreadyStarted,

    #[error("agent already stopped")]
    AlreadyStopped,

    #[error("invalid agent options: {0}")]
    InvalidOptions(String),
}

/// A task was added to a workflow it does not belong to.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(
        "mismatch runtime or workflow id, {expected_re_name}/{expected_workflow} is different from {actual_re_name}/{actual_workflow}"
    )]
    MetadataMismatch {
        expected_re_name: String,
        expected_workflow: String,
        actual_re_name: String,
        actual_workflow: String,
    },
}

/// Failure of a runtime to realize a task.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The cluster rejected the operation.
    #[error("failed handling {task_type} task for \"{target}\": {source}")]
    TaskExecution {
        task_type: TaskType,
        target: String,
        #[source]
        source: ClusterError,
    },

    /// The runtime does not know how to handle this task type.
    #[error("runtime cannot handle {0} tasks")]
    Unsupported(TaskType),
}

/// Outcome of a single task processed by the workflow queue.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No runtime is registered for the task's `reName`.
    #[error("runtime environment not found: {re_name}")]
    UnknownExecutor { re_name: String },

    #[error(transparent)]
    Execution(#[from] RuntimeError),

    #[error("task did not finish within {0:?}")]
    Timeout(Duration),

    #[error("runtime panicked while handling the task")]
    Panicked,
}
