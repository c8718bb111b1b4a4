use std::sync::Arc;

use annolab_common::model::{ProjectName, WorkflowId};
use tracing::{error, info};

use crate::broker::{BrokerClient, BrokerError, SubmittedNode};
use crate::error::AiTaskError;
use crate::metrics;
use crate::model::{TaskNode, WorkflowDocument};
use crate::repo::history::WorkflowHistoryRepo;
use crate::service::tracker::WorkflowTracker;
use crate::workflow::graph::{FlatNode, TaskGraph, QUEUE_AI_WORKER};

/// Zips the broker's id tree with the graph's name projection. Both sides
/// come out of the same flattening order, so a shape mismatch means the
/// adapter mis-encoded the graph.
fn zip_names(flat: &[FlatNode], submitted: &[SubmittedNode]) -> Result<Vec<TaskNode>, BrokerError> {
    if flat.len() != submitted.len() {
        return Err(BrokerError::Protocol(format!(
            "Submitted task tree has {} nodes where the graph has {}",
            submitted.len(),
            flat.len()
        )));
    }
    flat.iter()
        .zip(submitted)
        .map(|(name_node, id_node)| {
            Ok(TaskNode {
                id: id_node.id,
                name: name_node.name.clone(),
                children: zip_names(&name_node.children, &id_node.children)?,
            })
        })
        .collect()
}

/// Hands compiled graphs to the broker: writes the pending history row,
/// submits with the workflow id as the terminal task id, and persists the
/// named (id, children) projection for status polling.
pub struct TaskDispatcher {
    history_repo: Arc<dyn WorkflowHistoryRepo>,
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<WorkflowTracker>,
}

impl TaskDispatcher {
    pub fn new(
        history_repo: Arc<dyn WorkflowHistoryRepo>,
        broker: Arc<dyn BrokerClient>,
        tracker: Arc<WorkflowTracker>,
    ) -> Self {
        TaskDispatcher {
            history_repo,
            broker,
            tracker,
        }
    }

    pub async fn launch(
        &self,
        project: &ProjectName,
        graph: &TaskGraph,
        document: &WorkflowDocument,
        author: Option<&str>,
    ) -> Result<WorkflowId, AiTaskError> {
        let workflow_id = WorkflowId::new_v4();
        self.history_repo
            .insert(project, workflow_id, &document.to_json(), author)
            .await?;

        let submitted = match self.broker.submit(QUEUE_AI_WORKER, workflow_id, graph).await {
            Ok(submitted) => submitted,
            Err(broker_error) => {
                // a failed submission must leave no history row behind
                if let Err(cleanup_error) = self
                    .history_repo
                    .delete(project, &[workflow_id])
                    .await
                {
                    error!(
                        project = %project,
                        workflow_id = %workflow_id,
                        "Could not remove history row of failed dispatch: {cleanup_error}"
                    );
                }
                return Err(broker_error.into());
            }
        };

        let tree = zip_names(&graph.flatten(), &submitted)?;
        self.history_repo
            .set_tasks(project, workflow_id, &tree)
            .await?;
        self.tracker.register(project, workflow_id, tree).await;

        metrics::record_workflow_launched(author.is_none());
        info!(
            project = %project,
            workflow_id = %workflow_id,
            launched_by = author.unwrap_or("(auto)"),
            "Workflow dispatched"
        );
        Ok(workflow_id)
    }
}
