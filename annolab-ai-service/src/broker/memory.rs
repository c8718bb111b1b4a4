use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use annolab_common::model::{TaskId, WorkflowId};
use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;

use crate::broker::{
    ActiveTask, BrokerClient, BrokerError, SubmittedNode, TaskState, TaskStatus, WorkerInfo,
    WorkerSnapshot,
};
use crate::workflow::graph::{task_names, TaskGraph, TaskSignature};

/// Broker double for tests and local wiring: workers are registered
/// explicitly, submitted tasks sit in an "active" state until a test
/// completes or fails them, and group barriers derive their state from
/// their members.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    workers: Vec<WorkerRegistration>,
    tasks: HashMap<TaskId, SimTask>,
    external: Vec<ActiveTask>,
    revoked: Vec<TaskId>,
    next_worker: usize,
    unavailable: bool,
}

struct WorkerRegistration {
    id: String,
    queues: BTreeSet<String>,
}

struct SimTask {
    name: String,
    project: Option<String>,
    worker: Option<String>,
    kind: SimTaskKind,
    forgets: u32,
}

enum SimTaskKind {
    Leaf(LeafState),
    Barrier(Vec<TaskId>),
}

struct LeafState {
    status: TaskStatus,
    info: Option<Value>,
    error: Option<String>,
    active: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    pub fn register_worker(&self, id: &str, queues: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.workers.push(WorkerRegistration {
            id: id.to_string(),
            queues: queues.iter().map(|q| q.to_string()).collect(),
        });
    }

    /// Marks the broker as unreachable; every call returns
    /// `BrokerError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Injects a live task that was not submitted through this client, as
    /// seen during reconciliation after a controller restart.
    pub fn add_external_task(&self, worker: &str, id: &str, name: &str, project: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        let task = ActiveTask {
            id: id.to_string(),
            name: name.to_string(),
            project: project.map(str::to_string),
        };
        state.external.push(task);
        if !state.workers.iter().any(|w| w.id == worker) {
            state.workers.push(WorkerRegistration {
                id: worker.to_string(),
                queues: BTreeSet::new(),
            });
        }
    }

    pub fn clear_external_tasks(&self) {
        self.state.lock().unwrap().external.clear();
    }

    pub fn complete_task(&self, task_id: &TaskId) {
        self.finish(task_id, TaskStatus::Success, None);
    }

    pub fn fail_task(&self, task_id: &TaskId, message: &str) {
        self.finish(task_id, TaskStatus::Failure, Some(message.to_string()));
    }

    /// Completes every still-active leaf task.
    pub fn complete_all(&self) {
        let mut state = self.state.lock().unwrap();
        for task in state.tasks.values_mut() {
            if let SimTaskKind::Leaf(leaf) = &mut task.kind {
                if leaf.active {
                    leaf.status = TaskStatus::Success;
                    leaf.active = false;
                }
            }
        }
    }

    pub fn forget_count(&self, task_id: &TaskId) -> u32 {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(task_id)
            .map(|task| task.forgets)
            .unwrap_or(0)
    }

    pub fn revoked_tasks(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().revoked.clone()
    }

    fn finish(&self, task_id: &TaskId, status: TaskStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if let Some(SimTask {
            kind: SimTaskKind::Leaf(leaf),
            ..
        }) = state.tasks.get_mut(task_id)
        {
            leaf.status = status;
            leaf.info = error.as_ref().map(|message| json!({ "message": message }));
            leaf.error = error;
            leaf.active = false;
        }
    }

    fn register_leaf(state: &mut BrokerState, id: TaskId, signature: &TaskSignature) {
        let queue = signature.queue;
        let worker = {
            let eligible: Vec<&WorkerRegistration> = state
                .workers
                .iter()
                .filter(|w| w.queues.contains(queue))
                .collect();
            if eligible.is_empty() {
                None
            } else {
                let chosen = eligible[state.next_worker % eligible.len()].id.clone();
                state.next_worker += 1;
                Some(chosen)
            }
        };
        state.tasks.insert(
            id,
            SimTask {
                name: signature.name.clone(),
                project: signature.project().map(str::to_string),
                worker,
                kind: SimTaskKind::Leaf(LeafState {
                    status: TaskStatus::Pending,
                    info: None,
                    error: None,
                    active: true,
                }),
                forgets: 0,
            },
        );
    }

    fn build(state: &mut BrokerState, graph: &TaskGraph, out: &mut Vec<SubmittedNode>) {
        match graph {
            TaskGraph::Single(signature) => {
                let id = TaskId::new_v4();
                Self::register_leaf(state, id, signature);
                out.push(SubmittedNode {
                    id,
                    children: Vec::new(),
                });
            }
            TaskGraph::Chain(items) => {
                for item in items {
                    Self::build(state, item, out);
                }
            }
            TaskGraph::Group(members) => {
                let mut children = Vec::new();
                for member in members {
                    Self::build(state, member, &mut children);
                }
                let id = TaskId::new_v4();
                let child_ids = children.iter().map(|c| c.id).collect();
                state.tasks.insert(
                    id,
                    SimTask {
                        name: task_names::GROUP.to_string(),
                        project: None,
                        worker: None,
                        kind: SimTaskKind::Barrier(child_ids),
                        forgets: 0,
                    },
                );
                out.push(SubmittedNode { id, children });
            }
            TaskGraph::Chord { header, body } => {
                let mut children = Vec::new();
                for member in header {
                    Self::build(state, member, &mut children);
                }
                let id = TaskId::new_v4();
                let child_ids = children.iter().map(|c| c.id).collect();
                state.tasks.insert(
                    id,
                    SimTask {
                        name: task_names::GROUP.to_string(),
                        project: None,
                        worker: None,
                        kind: SimTaskKind::Barrier(child_ids),
                        forgets: 0,
                    },
                );
                out.push(SubmittedNode { id, children });

                let body_id = TaskId::new_v4();
                Self::register_leaf(state, body_id, body);
                out.push(SubmittedNode {
                    id: body_id,
                    children: Vec::new(),
                });
            }
        }
    }

    fn leaf_state(state: &BrokerState, task_id: &TaskId) -> TaskState {
        match state.tasks.get(task_id) {
            Some(SimTask {
                kind: SimTaskKind::Leaf(leaf),
                ..
            }) => TaskState {
                status: leaf.status,
                info: leaf.info.clone(),
                error: leaf.error.clone(),
            },
            Some(SimTask {
                kind: SimTaskKind::Barrier(children),
                ..
            }) => {
                let child_states: Vec<TaskState> = children
                    .iter()
                    .map(|child| Self::leaf_state(state, child))
                    .collect();
                if child_states.iter().all(TaskState::ready) {
                    if child_states.iter().all(TaskState::successful) {
                        TaskState {
                            status: TaskStatus::Success,
                            info: None,
                            error: None,
                        }
                    } else {
                        let error = child_states
                            .iter()
                            .find_map(|child| child.error.clone());
                        TaskState {
                            status: TaskStatus::Failure,
                            info: error.as_ref().map(|message| json!({ "message": message })),
                            error,
                        }
                    }
                } else {
                    TaskState {
                        status: TaskStatus::Pending,
                        info: None,
                        error: None,
                    }
                }
            }
            // unknown ids report PENDING, mirroring result-backend semantics
            None => TaskState {
                status: TaskStatus::Pending,
                info: None,
                error: None,
            },
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn submit(
        &self,
        _queue: &str,
        workflow_id: WorkflowId,
        graph: &TaskGraph,
    ) -> Result<Vec<SubmittedNode>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }

        let mut nodes = Vec::new();
        Self::build(&mut state, graph, &mut nodes);

        // the caller-supplied id goes to the terminal task
        if let Some(last) = nodes.last_mut() {
            let old_id = last.id;
            last.id = TaskId(workflow_id.0);
            if let Some(task) = state.tasks.remove(&old_id) {
                state.tasks.insert(last.id, task);
            }
        }
        Ok(nodes)
    }

    async fn task_state(&self, task_id: &TaskId) -> Result<TaskState, BrokerError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        Ok(Self::leaf_state(&state, task_id))
    }

    async fn forget(&self, task_id: &TaskId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.forgets += 1;
            if let SimTaskKind::Leaf(leaf) = &mut task.kind {
                leaf.status = TaskStatus::Pending;
                leaf.info = None;
                leaf.error = None;
            }
        }
        Ok(())
    }

    async fn revoke(&self, task_id: &TaskId, _terminate: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }
        state.revoked.push(*task_id);
        if let Some(SimTask {
            kind: SimTaskKind::Leaf(leaf),
            ..
        }) = state.tasks.get_mut(task_id)
        {
            if !leaf.status.is_ready() {
                leaf.status = TaskStatus::Revoked;
                leaf.active = false;
            }
        }
        Ok(())
    }

    async fn inspect(&self) -> Result<WorkerSnapshot, BrokerError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }

        let mut workers: Vec<WorkerInfo> = state
            .workers
            .iter()
            .map(|registration| WorkerInfo {
                id: registration.id.clone(),
                queues: registration.queues.clone(),
                active: Vec::new(),
            })
            .collect();

        for (id, task) in &state.tasks {
            let SimTaskKind::Leaf(leaf) = &task.kind else {
                continue;
            };
            if !leaf.active {
                continue;
            }
            let Some(worker_id) = &task.worker else {
                continue;
            };
            if let Some(worker) = workers.iter_mut().find(|w| w.id == *worker_id) {
                worker.active.push(ActiveTask {
                    id: id.to_string(),
                    name: task.name.clone(),
                    project: task.project.clone(),
                });
            }
        }

        for external in &state.external {
            if let Some(worker) = workers.first_mut() {
                worker.active.push(external.clone());
            }
        }

        Ok(WorkerSnapshot { workers })
    }
}
