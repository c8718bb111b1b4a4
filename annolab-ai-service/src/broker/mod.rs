pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::{Display, Formatter};

use annolab_common::model::{TaskId, WorkflowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::graph::{is_ai_task_name, TaskGraph};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
    #[error("Task {0} is not known to the broker")]
    UnknownTask(TaskId),
    #[error("Broker protocol error: {0}")]
    Protocol(String),
}

/// Broker-reported task states, plus the aggregate `Successful` marker a
/// parent node gets once all of its children are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "REVOKED")]
    Revoked,
    /// Synthetic state for ids the broker could not be asked about.
    #[serde(rename = "ERROR")]
    Error,
    /// Aggregate state: every child of the node is ready.
    #[serde(rename = "SUCCESSFUL")]
    Successful,
}

impl TaskStatus {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Revoked => "REVOKED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Successful => "SUCCESSFUL",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one task's backend state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: TaskStatus,
    /// Progress payload while running, or the failure payload.
    pub info: Option<Value>,
    /// Error message for failed tasks.
    pub error: Option<String>,
}

impl TaskState {
    pub fn ready(&self) -> bool {
        self.status.is_ready()
    }

    pub fn successful(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Id tree returned by a submission: one node per step of the flattened
/// root chain, with group members as children. Structurally parallel to
/// `TaskGraph::flatten`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedNode {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SubmittedNode>,
}

/// A task currently executing on some worker. Ids are kept as raw strings:
/// the broker may host tasks whose ids are not UUIDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl ActiveTask {
    pub fn is_ai_task(&self) -> bool {
        is_ai_task_name(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub queues: BTreeSet<String>,
    pub active: Vec<ActiveTask>,
}

/// Result of a global broker inspection: every live worker with its
/// advertised queues and currently active tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub workers: Vec<WorkerInfo>,
}

impl WorkerSnapshot {
    pub fn count_queue_consumers(&self, queue: &str) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.queues.contains(queue))
            .count()
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &ActiveTask> {
        self.workers.iter().flat_map(|worker| worker.active.iter())
    }

    /// Live tasks belonging to the AI orchestration, optionally restricted
    /// to one project.
    pub fn ai_tasks<'a>(
        &'a self,
        project: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ActiveTask> {
        self.active_tasks().filter(move |task| {
            task.is_ai_task()
                && match project {
                    Some(project) => task.project.as_deref() == Some(project),
                    None => true,
                }
        })
    }
}

/// Thin adapter to the message broker. Only implementations of this trait
/// know how a concrete broker encodes chains, groups and chords; everything
/// else in the service works on `TaskGraph` and the types above.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submits a graph on the given queue. The caller-supplied workflow id
    /// must be assigned to the graph's terminal task so that history rows
    /// and live tasks stay joinable. Results are retained (not ignored)
    /// until `forget` is called.
    async fn submit(
        &self,
        queue: &str,
        workflow_id: WorkflowId,
        graph: &TaskGraph,
    ) -> Result<Vec<SubmittedNode>, BrokerError>;

    async fn task_state(&self, task_id: &TaskId) -> Result<TaskState, BrokerError>;

    /// Releases backend memory held for a task's result.
    async fn forget(&self, task_id: &TaskId) -> Result<(), BrokerError>;

    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), BrokerError>;

    async fn inspect(&self) -> Result<WorkerSnapshot, BrokerError>;
}
