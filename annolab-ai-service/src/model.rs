use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use annolab_common::model::{ModelStateId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::TaskStatus;

pub type Kwargs = serde_json::Map<String, Value>;

/// Closed set of task types a workflow document may contain. `Repeater` and
/// `Connector` are structural markers that compile to no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "train")]
    Train,
    #[serde(rename = "inference")]
    Inference,
    #[serde(rename = "repeater")]
    Repeater,
    #[serde(rename = "connector")]
    Connector,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Train => "train",
            TaskKind::Inference => "inference",
            TaskKind::Repeater => "repeater",
            TaskKind::Connector => "connector",
        }
    }

    /// Structural markers are skipped during compilation.
    pub fn is_noop(&self) -> bool {
        matches!(self, TaskKind::Repeater | TaskKind::Connector)
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(TaskKind::Train),
            "inference" => Ok(TaskKind::Inference),
            "repeater" => Ok(TaskKind::Repeater),
            "connector" => Ok(TaskKind::Connector),
            other => Err(format!("Unknown task type: {other}")),
        }
    }
}

/// A task entry in a workflow document: either a bare type name
/// (`"train"`) expanded from defaults, or a full node description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskSpec {
    Name(TaskKind),
    Node(NodeSpec),
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Name(kind) => *kind,
            TaskSpec::Node(node) => node.kind,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            TaskSpec::Name(_) => None,
            TaskSpec::Node(node) => node.id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Kwargs::is_empty")]
    pub kwargs: Kwargs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeaterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TaskKind>,
    pub start_node: String,
    pub end_node: String,
    #[serde(default)]
    pub kwargs: RepeaterKwargs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeaterKwargs {
    #[serde(default)]
    pub num_repetitions: i64,
}

/// Declarative workflow description as submitted by callers; the original,
/// unexpanded form of this document is what ends up in the history table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub repeaters: BTreeMap<String, RepeaterSpec>,
    #[serde(default, skip_serializing_if = "Kwargs::is_empty")]
    pub options: Kwargs,
}

impl WorkflowDocument {
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A task spec after repeater expansion and kwarg auto-completion. The
/// `epoch`, `numEpochs` and clamped `max_num_workers` entries live in
/// `kwargs`, mirroring what the remote workers receive.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedTaskSpec {
    pub kind: TaskKind,
    pub kwargs: Kwargs,
}

impl ExpandedTaskSpec {
    pub fn epoch(&self) -> Option<u64> {
        self.kwargs.get("epoch").and_then(Value::as_u64)
    }

    pub fn num_epochs(&self) -> Option<u64> {
        self.kwargs.get("numEpochs").and_then(Value::as_u64)
    }

    pub fn max_num_workers(&self) -> Option<i64> {
        self.kwargs.get("max_num_workers").and_then(Value::as_i64)
    }
}

/// Persisted projection of a dispatched task graph (the `tasks` JSONB
/// column): broker task ids with names, one level of children for group
/// members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskNode>,
}

impl TaskNode {
    pub fn collect_ids(&self, out: &mut Vec<TaskId>) {
        out.push(self.id);
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.id == *id || self.children.iter().any(|child| child.contains(id))
    }
}

pub fn tree_task_ids(tree: &[TaskNode]) -> Vec<TaskId> {
    let mut ids = Vec::new();
    for node in tree {
        node.collect_ids(&mut ids);
    }
    ids
}

pub fn tree_contains(tree: &[TaskNode], id: &TaskId) -> bool {
    tree.iter().any(|node| node.contains(id))
}

/// A task node decorated with live broker status, as returned by polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusNode {
    pub id: TaskId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_done: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskStatusNode>,
}

impl TaskStatusNode {
    pub fn bare(node: &TaskNode) -> Self {
        TaskStatusNode {
            id: node.id,
            name: node.name.clone(),
            status: None,
            successful: None,
            info: None,
            num_done: None,
            children: node.children.iter().map(TaskStatusNode::bare).collect(),
        }
    }
}

/// One row of `<project>.workflowhistory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHistoryRecord {
    pub id: WorkflowId,
    pub workflow: Value,
    pub launched_by: Option<String>,
    pub aborted_by: Option<String>,
    pub time_created: DateTime<Utc>,
    pub time_finished: Option<DateTime<Utc>>,
    pub succeeded: Option<bool>,
    pub messages: Option<Value>,
    pub tasks: Option<Vec<TaskNode>>,
}

impl WorkflowHistoryRecord {
    pub fn is_running(&self) -> bool {
        self.time_finished.is_none() && self.succeeded.is_none() && self.aborted_by.is_none()
    }
}

/// History row in the wire shape of status responses (epoch-second
/// timestamps, optional live `children` decoration).
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryReport {
    pub id: WorkflowId,
    pub launched_by: Option<String>,
    pub aborted_by: Option<String>,
    pub time_created: f64,
    pub time_finished: Option<f64>,
    pub succeeded: Option<bool>,
    pub messages: Option<Value>,
    pub tasks: Option<Vec<TaskNode>>,
    pub workflow: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TaskStatusNode>>,
}

impl From<WorkflowHistoryRecord> for TaskHistoryReport {
    fn from(record: WorkflowHistoryRecord) -> Self {
        TaskHistoryReport {
            id: record.id,
            launched_by: record.launched_by,
            aborted_by: record.aborted_by,
            time_created: record.time_created.timestamp_micros() as f64 / 1e6,
            time_finished: record
                .time_finished
                .map(|t| t.timestamp_micros() as f64 / 1e6),
            succeeded: record.succeeded,
            messages: record.messages,
            tasks: record.tasks,
            workflow: record.workflow,
            children: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum HistoryFilter {
    #[default]
    Both,
    Running,
    Finished,
}

/// Selector for bulk history deletion.
#[derive(Debug, Clone)]
pub enum HistorySelector {
    All,
    Ids(Vec<WorkflowId>),
}

/// Saved (reusable) workflow from `<project>.workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedWorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    pub workflow: Value,
    pub username: String,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedWorkflowMeta {
    pub name: String,
    pub workflow: Value,
    pub author: String,
    pub time_created: f64,
    pub time_modified: f64,
    pub default_workflow: bool,
}

/// Metadata projection of a `<project>.cnnstate` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStateMeta {
    pub id: ModelStateId,
    pub time_created: DateTime<Utc>,
    pub model_library: Option<String>,
    pub al_criterion_library: Option<String>,
    pub num_pred: i64,
    pub labelclass_autoupdate: bool,
    pub imported_from_marketplace: bool,
    pub marketplace_origin_id: Option<Uuid>,
}

/// Statistics row used for training-series assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStateStatsRow {
    pub id: ModelStateId,
    pub model_library: Option<String>,
    pub time_created: f64,
    pub stats: Option<Value>,
}

/// Model Marketplace metadata attached to model-state listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceMeta {
    pub id: Uuid,
    pub origin_uuid: Option<Uuid>,
    pub author: Option<String>,
    pub anonymous: Option<bool>,
    pub public: Option<bool>,
    pub shared: Option<bool>,
    pub tags: Option<Value>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub citation_info: Option<String>,
    pub license: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LabelClassRow {
    pub name: String,
    pub idx: i32,
    pub hidden: bool,
}
