//! Runner agent core.
//!
//! The agent polls Codefresh for pod/PVC lifecycle tasks and executes them
//! against Kubernetes. Tasks of one workflow run strictly in order; tasks of
//! different workflows run concurrently and never wait on each other.
//!
//! - [`Agent`]: poll and report loops
//! - [`WorkflowQueue`]: per-workflow ordered dispatch
//! - [`Runtime`] / [`KubernetesRuntime`]: turning a task into cluster calls
//! - [`workflow`]: grouping of pulled tasks into workflows

pub mod agent;
pub mod agent_task;
pub mod config;
pub mod error;
pub mod kubernetes;
pub mod queue;
pub mod runtime;
pub mod server;
pub mod telemetry;
pub mod workflow;

pub use agent::{Agent, AgentOptions, Status};
pub use agent_task::{AgentTaskError, AgentTaskExecutor};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{AgentError, RuntimeError, TaskError, WorkflowError};
pub use kubernetes::{Cluster, ClusterError, KubeCluster};
pub use queue::{QueueOptions, TaskReport, WorkflowQueue};
pub use runtime::{KubernetesRuntime, Runtime};
pub use workflow::{group_tasks, split_by_category, Categorized, Workflow, WorkflowKind};
