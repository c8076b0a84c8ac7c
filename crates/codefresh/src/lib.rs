//! Codefresh control-plane client for the runner agent.
//!
//! The agent pulls pod/PVC lifecycle tasks from the Codefresh API and pushes a
//! periodic health snapshot back. This crate owns both sides of that contract:
//!
//! - [`Task`] and friends: the task model, decoded from the wire into a typed
//!   [`TaskSpec`] before anything downstream sees it
//! - [`Codefresh`]: the client trait the agent is written against
//! - [`CodefreshClient`]: the reqwest implementation of it
//!
//! # Usage
//!
//! ```no_run
//! use codefresh::{AgentStatus, ClientOptions, Codefresh, CodefreshClient};
//!
//! # async fn run() -> Result<(), codefresh::CodefreshError> {
//! let client = CodefreshClient::new(ClientOptions {
//!     token: "token".to_string(),
//!     agent_id: "agent-1".to_string(),
//!     ..ClientOptions::default()
//! })?;
//!
//! for task in client.tasks().await? {
//!     println!("{} -> {}", task.task_type(), task.target());
//! }
//!
//! client.report_status(&AgentStatus::healthy()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod task;

pub use client::{AgentStatus, ClientOptions, Codefresh, CodefreshClient, DEFAULT_HOST};
pub use error::{CodefreshError, DecodeError};
pub use task::{decode_task, AgentTaskSpec, Metadata, ResourceRef, Task, TaskSpec, TaskType};
