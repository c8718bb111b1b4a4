use std::collections::HashMap;
use std::sync::Arc;

use annolab_common::model::{ProjectName, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, TaskStatus};
use crate::error::AiTaskError;
use crate::metrics;
use crate::model::{
    tree_contains, tree_task_ids, HistoryFilter, HistorySelector, TaskHistoryReport, TaskNode,
    TaskStatusNode, WorkflowHistoryRecord,
};
use crate::repo::history::WorkflowHistoryRepo;

/// Owns the live status protocol: polling, terminal detection, revocation,
/// active enumeration and the reconciliation between persistent history and
/// the broker's live task set. Task trees are cached per project; the
/// store stays authoritative.
pub struct WorkflowTracker {
    history_repo: Arc<dyn WorkflowHistoryRepo>,
    broker: Arc<dyn BrokerClient>,
    cache: RwLock<HashMap<ProjectName, HashMap<WorkflowId, Vec<TaskNode>>>>,
}

struct PolledTree {
    nodes: Vec<TaskStatusNode>,
    finished: bool,
    errors: Vec<String>,
}

impl WorkflowTracker {
    pub fn new(history_repo: Arc<dyn WorkflowHistoryRepo>, broker: Arc<dyn BrokerClient>) -> Self {
        WorkflowTracker {
            history_repo,
            broker,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Caches a freshly dispatched task tree.
    pub async fn register(&self, project: &ProjectName, id: WorkflowId, tree: Vec<TaskNode>) {
        let mut cache = self.cache.write().await;
        cache.entry(project.clone()).or_default().insert(id, tree);
    }

    async fn cache_remove(&self, project: &ProjectName, id: WorkflowId) {
        let mut cache = self.cache.write().await;
        if let Some(trees) = cache.get_mut(project) {
            trees.remove(&id);
        }
    }

    async fn resolve_tree(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<Vec<TaskNode>>, AiTaskError> {
        {
            let cache = self.cache.read().await;
            if let Some(tree) = cache.get(project).and_then(|trees| trees.get(&id)) {
                return Ok(Some(tree.clone()));
            }
        }
        match self.history_repo.get_tasks(project, id).await? {
            Some(tree) => {
                self.register(project, id, tree.clone()).await;
                Ok(Some(tree))
            }
            None => Ok(None),
        }
    }

    async fn node_status(&self, node: &TaskNode, errors: &mut Vec<String>) -> TaskStatusNode {
        let mut status_node = TaskStatusNode::bare(node);
        status_node.children = Vec::new();

        match self.broker.task_state(&node.id).await {
            Ok(state) => {
                status_node.status = Some(state.status);
                if state.ready() {
                    let successful = state.successful();
                    status_node.successful = Some(successful);
                    if successful {
                        status_node.info = None;
                    } else {
                        let message = state
                            .error
                            .unwrap_or_else(|| format!("Task {} failed", node.id));
                        errors.push(message.clone());
                        status_node.info = Some(json!({ "message": message }));
                    }
                } else {
                    status_node.info = state.info;
                }
            }
            Err(broker_error) => {
                // synthetic state for ids the broker could not be asked about
                status_node.status = Some(TaskStatus::Error);
                status_node.info = Some(json!({ "message": broker_error.to_string() }));
            }
        }
        status_node
    }

    async fn poll_tree(&self, tree: &[TaskNode]) -> PolledTree {
        let mut errors = Vec::new();
        let mut nodes = Vec::new();

        for task in tree {
            let mut node = self.node_status(task, &mut errors).await;
            if !task.children.is_empty() {
                let mut num_done = 0;
                for child in &task.children {
                    let child_node = self.node_status(child, &mut errors).await;
                    if child_node.successful.is_some() {
                        num_done += 1;
                    }
                    node.children.push(child_node);
                }
                node.num_done = Some(num_done);
                if num_done == task.children.len() {
                    node.status = Some(TaskStatus::Successful);
                }
            }
            nodes.push(node);
        }

        // the last node of the root chain is the canonical terminator
        let finished = match tree.last() {
            Some(last) => match self.broker.task_state(&last.id).await {
                Ok(state) => state.ready(),
                Err(_) => false,
            },
            None => false,
        };

        PolledTree {
            nodes,
            finished,
            errors,
        }
    }

    fn stored_status(record: &WorkflowHistoryRecord) -> Vec<TaskStatusNode> {
        let status = if record.aborted_by.is_some() {
            TaskStatus::Revoked
        } else if record.succeeded == Some(true) {
            TaskStatus::Success
        } else {
            TaskStatus::Failure
        };
        let decorate = |node: &TaskNode| {
            let mut status_node = TaskStatusNode::bare(node);
            status_node.status = Some(status);
            status_node.successful = record.succeeded;
            for child in &mut status_node.children {
                child.status = Some(status);
                child.successful = record.succeeded;
            }
            status_node
        };
        record
            .tasks
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(decorate)
            .collect()
    }

    /// Polls the broker for the status of every (sub-)task of a workflow.
    /// On the terminal transition the history row is finalised, broker
    /// results are forgotten and the cache entry dropped; finished
    /// workflows answer from the store without broker calls.
    pub async fn poll_task_status(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Vec<TaskStatusNode>, AiTaskError> {
        let record = self
            .history_repo
            .get(project, id)
            .await?
            .ok_or_else(|| AiTaskError::UnknownWorkflow(id.to_string()))?;

        if record.time_finished.is_some() {
            self.cache_remove(project, id).await;
            return Ok(Self::stored_status(&record));
        }

        let tree = match &record.tasks {
            Some(tree) => tree.clone(),
            None => return Ok(Vec::new()),
        };

        let polled = self.poll_tree(&tree).await;
        if polled.finished {
            let succeeded = polled.errors.is_empty();
            let messages = Value::Array(
                polled
                    .errors
                    .iter()
                    .map(|message| Value::String(message.clone()))
                    .collect(),
            );
            let applied = self
                .history_repo
                .mark_finished(project, id, succeeded, &messages)
                .await?;
            if applied {
                for task_id in tree_task_ids(&tree) {
                    if let Err(forget_error) = self.broker.forget(&task_id).await {
                        debug!(
                            workflow_id = %id,
                            "Could not forget task {task_id}: {forget_error}"
                        );
                    }
                }
                metrics::record_workflow_finished(succeeded);
            }
            self.cache_remove(project, id).await;
        }
        Ok(polled.nodes)
    }

    /// History rows in the wire shape, without live decoration.
    pub async fn get_tasks(
        &self,
        project: &ProjectName,
        filter: HistoryFilter,
        min_time_created: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<TaskHistoryReport>, AiTaskError> {
        let records = self
            .history_repo
            .list(project, filter, min_time_created, limit)
            .await?;
        Ok(records.into_iter().map(TaskHistoryReport::from).collect())
    }

    /// All history rows, each refreshed with a live status poll.
    pub async fn poll_all_task_statuses(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<TaskHistoryReport>, AiTaskError> {
        let records = self
            .history_repo
            .list(project, HistoryFilter::Both, None, None)
            .await?;
        let mut reports = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            let mut report = TaskHistoryReport::from(record);
            report.children = Some(self.poll_task_status(project, id).await?);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Running workflows (no finish time, no verdict, not aborted), newest
    /// first. Trees are cached for subsequent polls.
    pub async fn active_ids(&self, project: &ProjectName) -> Result<Vec<WorkflowId>, AiTaskError> {
        let rows = self.history_repo.active(project).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for (id, tree) in rows {
            if let Some(tree) = tree {
                self.register(project, id, tree).await;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Revokes every task of the workflow (terminate requested) and marks
    /// the row aborted. Broker-side failures are logged, not surfaced;
    /// repeated revocations are safe.
    pub async fn revoke(
        &self,
        username: &str,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<(), AiTaskError> {
        if let Some(tree) = self.resolve_tree(project, id).await? {
            for task_id in tree_task_ids(&tree) {
                if let Err(revoke_error) = self.broker.revoke(&task_id, true).await {
                    warn!(
                        workflow_id = %id,
                        "Could not revoke task {task_id}: {revoke_error}"
                    );
                }
            }
        }
        self.history_repo
            .mark_aborted(project, id, username)
            .await?;
        self.cache_remove(project, id).await;
        metrics::record_workflow_aborted();
        Ok(())
    }

    /// Reconciles persistent running rows against the broker's live task
    /// set. Rows with no matching live AI task become orphans; live
    /// project tasks unknown to the running set resurrect their rows. A
    /// row qualifying for both ends up resurrected: the broker is
    /// authoritative for "currently running". Returns the ids of confirmed
    /// live AI tasks for this project.
    pub async fn reconcile(&self, project: &ProjectName) -> Result<Vec<String>, AiTaskError> {
        let running = self.history_repo.running(project).await?;
        let snapshot = match self.broker.inspect().await {
            Ok(snapshot) => snapshot,
            Err(broker_error) => {
                metrics::record_broker_inspection_failure();
                return Err(broker_error.into());
            }
        };
        let live: Vec<(TaskId, String)> = snapshot
            .ai_tasks(Some(project.as_str()))
            .filter_map(|task| {
                Uuid::parse_str(&task.id)
                    .ok()
                    .map(|uuid| (TaskId(uuid), task.id.clone()))
            })
            .collect();

        let mut tasks_running = Vec::new();
        let mut orphaned = Vec::new();
        for (workflow_id, tree) in &running {
            let tree = tree.as_deref().unwrap_or(&[]);
            let matched: Vec<&String> = live
                .iter()
                .filter(|(task_id, _)| {
                    task_id.0 == workflow_id.0 || tree_contains(tree, task_id)
                })
                .map(|(_, raw)| raw)
                .collect();
            if matched.is_empty() {
                orphaned.push(*workflow_id);
            } else {
                tasks_running.extend(matched.into_iter().cloned());
            }
        }

        let mut resurrected = Vec::new();
        for (task_id, raw) in &live {
            let known = running.iter().any(|(workflow_id, tree)| {
                workflow_id.0 == task_id.0
                    || tree
                        .as_deref()
                        .map(|tree| tree_contains(tree, task_id))
                        .unwrap_or(false)
            });
            if !known {
                resurrected.push(WorkflowId(task_id.0));
                tasks_running.push(raw.clone());
            }
        }

        // resurrected wins over orphaned
        orphaned.retain(|workflow_id| !resurrected.contains(workflow_id));

        self.history_repo.mark_orphaned(project, &orphaned).await?;
        self.history_repo.resurrect(project, &resurrected).await?;
        Ok(tasks_running)
    }

    /// Bulk history deletion. Running rows are skipped unless
    /// `revoke_running`, in which case their terminal tasks are revoked
    /// first.
    pub async fn delete_history(
        &self,
        project: &ProjectName,
        selector: HistorySelector,
        revoke_running: bool,
    ) -> Result<Vec<WorkflowId>, AiTaskError> {
        let mut ids = match selector {
            HistorySelector::All => {
                self.history_repo
                    .all_ids(project, !revoke_running)
                    .await?
            }
            HistorySelector::Ids(ids) => ids,
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        if revoke_running {
            for id in &ids {
                if let Err(revoke_error) = self.broker.revoke(&TaskId(id.0), true).await {
                    warn!(workflow_id = %id, "Could not revoke workflow: {revoke_error}");
                }
            }
        } else {
            let ongoing = self.active_ids(project).await?;
            ids.retain(|id| !ongoing.contains(id));
        }

        let deleted = self.history_repo.delete(project, &ids).await?;
        {
            let mut cache = self.cache.write().await;
            if let Some(trees) = cache.get_mut(project) {
                for id in &deleted {
                    trees.remove(id);
                }
            }
        }
        Ok(deleted)
    }
}
