use serde_json::Value;

use crate::model::Kwargs;

pub const QUEUE_AI_WORKER: &str = "AIWorker";
pub const QUEUE_AI_CONTROLLER: &str = "AIController";

/// Broker task names. Status reconciliation identifies AI tasks by the
/// `aiworker` prefix plus the two image-acquisition names, so these strings
/// are part of the wire contract with the workers.
pub mod task_names {
    pub const GET_TRAINING_IMAGES: &str = "aicontroller.get_training_images";
    pub const GET_INFERENCE_IMAGES: &str = "aicontroller.get_inference_images";
    pub const DELETE_MODEL_STATES: &str = "aicontroller.delete_model_states";
    pub const DUPLICATE_MODEL_STATE: &str = "aicontroller.duplicate_model_state";
    pub const GET_MODEL_TRAINING_STATISTICS: &str = "aicontroller.get_model_training_statistics";

    pub const CALL_TRAIN: &str = "aiworker.call_train";
    pub const CALL_INFERENCE: &str = "aiworker.call_inference";
    pub const CALL_UPDATE_MODEL: &str = "aiworker.call_update_model";
    pub const CALL_AVERAGE_MODEL_STATES: &str = "aiworker.call_average_model_states";

    /// Synthetic name assigned to group barrier nodes in persisted trees.
    pub const GROUP: &str = "group";
}

/// Whether a live broker task belongs to the AI orchestration (as opposed
/// to unrelated tasks sharing the broker).
pub fn is_ai_task_name(name: &str) -> bool {
    let name = name.to_lowercase();
    name.starts_with("aiworker")
        || name == task_names::GET_TRAINING_IMAGES
        || name == task_names::GET_INFERENCE_IMAGES
}

/// A single broker task invocation: name, target queue and keyword
/// arguments as the worker receives them.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSignature {
    pub name: String,
    pub queue: &'static str,
    pub kwargs: Kwargs,
}

impl TaskSignature {
    pub fn new(name: &str, queue: &'static str, kwargs: Kwargs) -> Self {
        TaskSignature {
            name: name.to_string(),
            queue,
            kwargs,
        }
    }

    pub fn project(&self) -> Option<&str> {
        self.kwargs.get("project").and_then(Value::as_str)
    }
}

/// Broker-submittable task graph. Only the broker adapter knows how a
/// specific broker encodes these shapes; the compiler and dispatcher work
/// on this algebra alone.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskGraph {
    /// One broker task.
    Single(TaskSignature),
    /// Sibling tasks run in parallel.
    Group(Vec<TaskGraph>),
    /// A parallel group followed by a barrier task receiving the results.
    Chord {
        header: Vec<TaskGraph>,
        body: TaskSignature,
    },
    /// Sequential composition.
    Chain(Vec<TaskGraph>),
}

/// Name-level projection of a graph, structurally parallel to the id tree
/// a broker submission returns: one entry per step of the (flattened) root
/// chain; groups and chord headers contribute a barrier node with children,
/// chord bodies follow their header as a separate entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatNode {
    pub name: String,
    pub children: Vec<FlatNode>,
}

impl TaskGraph {
    pub fn single(signature: TaskSignature) -> TaskGraph {
        TaskGraph::Single(signature)
    }

    pub fn chain(items: Vec<TaskGraph>) -> TaskGraph {
        TaskGraph::Chain(items)
    }

    pub fn flatten(&self) -> Vec<FlatNode> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<FlatNode>) {
        match self {
            TaskGraph::Single(signature) => out.push(FlatNode {
                name: signature.name.clone(),
                children: Vec::new(),
            }),
            TaskGraph::Chain(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            TaskGraph::Group(members) => {
                let mut children = Vec::new();
                for member in members {
                    member.flatten_into(&mut children);
                }
                out.push(FlatNode {
                    name: task_names::GROUP.to_string(),
                    children,
                });
            }
            TaskGraph::Chord { header, body } => {
                let mut children = Vec::new();
                for member in header {
                    member.flatten_into(&mut children);
                }
                out.push(FlatNode {
                    name: task_names::GROUP.to_string(),
                    children,
                });
                out.push(FlatNode {
                    name: body.name.clone(),
                    children: Vec::new(),
                });
            }
        }
    }

    /// All leaf signatures in flattened order (chord bodies after their
    /// headers), matching the traversal order of `flatten`.
    pub fn signatures(&self) -> Vec<&TaskSignature> {
        let mut out = Vec::new();
        self.collect_signatures(&mut out);
        out
    }

    fn collect_signatures<'a>(&'a self, out: &mut Vec<&'a TaskSignature>) {
        match self {
            TaskGraph::Single(signature) => out.push(signature),
            TaskGraph::Chain(items) => {
                for item in items {
                    item.collect_signatures(out);
                }
            }
            TaskGraph::Group(members) => {
                for member in members {
                    member.collect_signatures(out);
                }
            }
            TaskGraph::Chord { header, body } => {
                for member in header {
                    member.collect_signatures(out);
                }
                out.push(body);
            }
        }
    }
}
