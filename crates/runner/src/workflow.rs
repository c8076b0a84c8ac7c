//! Workflow aggregates and task grouping.
//!
//! Tasks pulled in one poll cycle are partitioned by category (creation,
//! deletion, agent) and then grouped by workflow id. Each group is what the
//! queue must execute in order.

use std::collections::BTreeMap;

use codefresh::{Metadata, Task, TaskType};

use crate::error::WorkflowError;

/// Grouping key for tasks that carry no workflow id.
pub const FALLBACK_KEY: &str = "_";

/// Which kinds of tasks a workflow batch contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowKind {
    #[default]
    None,
    Create,
    Terminate,
    Both,
}

impl WorkflowKind {
    fn of(task_type: TaskType) -> Self {
        if task_type.is_creation() {
            Self::Create
        } else if task_type.is_deletion() {
            Self::Terminate
        } else {
            Self::None
        }
    }

    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, k) | (k, Self::None) => k,
            (a, b) if a == b => a,
            _ => Self::Both,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Create => "create",
            Self::Terminate => "terminate",
            Self::Both => "both",
        }
    }
}

/// Ordered batch of tasks sharing a runtime and workflow id.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub kind: WorkflowKind,
    /// Representative metadata, taken from the earliest created member.
    pub metadata: Metadata,
    pub tasks: Vec<Task>,
}

impl Workflow {
    #[must_use]
    pub fn new(metadata: Metadata) -> Self {
        Self {
            kind: WorkflowKind::None,
            metadata,
            tasks: Vec::with_capacity(3),
        }
    }

    /// Grouping key of this workflow.
    #[must_use]
    pub fn key(&self) -> &str {
        group_key(&self.metadata)
    }

    /// Append a task. The task must target the same runtime and workflow.
    pub fn add_task(&mut self, task: Task) -> Result<(), WorkflowError> {
        if self.metadata.re_name != task.metadata.re_name
            || self.metadata.workflow != task.metadata.workflow
        {
            return Err(WorkflowError::MetadataMismatch {
                expected_re_name: self.metadata.re_name.clone(),
                expected_workflow: self.metadata.workflow.clone(),
                actual_re_name: task.metadata.re_name.clone(),
                actual_workflow: task.metadata.workflow.clone(),
            });
        }

        // Earliest member wins.
        if task.metadata.created_at < self.metadata.created_at {
            self.metadata = task.metadata.clone();
        }

        self.kind = self.kind.merge(WorkflowKind::of(task.task_type()));
        self.tasks.push(task);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Grouping key of a task: its workflow id, or [`FALLBACK_KEY`].
#[must_use]
pub fn group_key(metadata: &Metadata) -> &str {
    if metadata.workflow.is_empty() {
        FALLBACK_KEY
    } else {
        &metadata.workflow
    }
}

/// Stable partition of `tasks` by grouping key.
///
/// Same-key tasks keep their relative order and no empty group is emitted.
pub fn group_tasks(tasks: impl IntoIterator<Item = Task>) -> BTreeMap<String, Vec<Task>> {
    let mut groups: BTreeMap<String, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        groups
            .entry(group_key(&task.metadata).to_string())
            .or_default()
            .push(task);
    }
    groups
}

/// Tasks of one poll cycle split by semantic category.
#[derive(Debug, Default)]
pub struct Categorized {
    pub creation: Vec<Task>,
    pub deletion: Vec<Task>,
    pub agent: Vec<Task>,
}

impl Categorized {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creation.is_empty() && self.deletion.is_empty() && self.agent.is_empty()
    }
}

/// Split tasks into creation, deletion and agent tasks, keeping order.
pub fn split_by_category(tasks: impl IntoIterator<Item = Task>) -> Categorized {
    let mut out = Categorized::default();
    for task in tasks {
        match task.task_type() {
            TaskType::CreatePod | TaskType::CreatePvc => out.creation.push(task),
            TaskType::DeletePod | TaskType::DeletePvc => out.deletion.push(task),
            TaskType::AgentTask => out.agent.push(task),
        }
    }
    out
}

/// Build one workflow per group, oldest workflow first.
///
/// Tasks that do not match their group's runtime are left out and their
/// errors returned alongside.
pub fn build_workflows(
    groups: BTreeMap<String, Vec<Task>>,
) -> (Vec<Workflow>, Vec<WorkflowError>) {
    let mut workflows = Vec::with_capacity(groups.len());
    let mut rejected = Vec::new();

    for tasks in groups.into_values() {
        let Some(first) = tasks.first() else {
            continue;
        };
        let mut workflow = Workflow::new(first.metadata.clone());
        for task in tasks {
            if let Err(e) = workflow.add_task(task) {
                rejected.push(e);
            }
        }
        workflows.push(workflow);
    }

    workflows.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
    (workflows, rejected)
}
