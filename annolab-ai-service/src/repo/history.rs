use std::ops::Deref;
use std::sync::Arc;

use annolab_common::model::{ProjectName, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::{HistoryFilter, TaskNode, WorkflowHistoryRecord};
use crate::repo::RepoError;

/// Message set on rows whose broker-side tasks vanished.
pub const ORPHANED_MESSAGE: &str = "Auto-launched task did not finish";

#[derive(sqlx::FromRow, Debug, Clone)]
struct HistoryRow {
    id: Uuid,
    workflow: Value,
    launched_by: Option<String>,
    aborted_by: Option<String>,
    time_created: DateTime<Utc>,
    time_finished: Option<DateTime<Utc>>,
    succeeded: Option<bool>,
    messages: Option<Value>,
    tasks: Option<Value>,
}

impl TryFrom<HistoryRow> for WorkflowHistoryRecord {
    type Error = RepoError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let tasks = parse_tasks(row.tasks)?;
        Ok(WorkflowHistoryRecord {
            id: WorkflowId(row.id),
            workflow: row.workflow,
            launched_by: row.launched_by,
            aborted_by: row.aborted_by,
            time_created: row.time_created,
            time_finished: row.time_finished,
            succeeded: row.succeeded,
            messages: row.messages,
            tasks,
        })
    }
}

fn parse_tasks(tasks: Option<Value>) -> Result<Option<Vec<TaskNode>>, RepoError> {
    tasks
        .map(serde_json::from_value::<Vec<TaskNode>>)
        .transpose()
        .map_err(RepoError::conversion)
}

/// One run of a workflow, in `<project>.workflowhistory`. Terminal writes
/// are conditional on `timeFinished IS NULL` so that the state machine's
/// transitions are enforced at the store.
#[async_trait]
pub trait WorkflowHistoryRepo: Send + Sync {
    async fn insert(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        workflow: &Value,
        launched_by: Option<&str>,
    ) -> Result<(), RepoError>;

    async fn set_tasks(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        tasks: &[TaskNode],
    ) -> Result<(), RepoError>;

    async fn get(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<WorkflowHistoryRecord>, RepoError>;

    async fn get_tasks(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<Vec<TaskNode>>, RepoError>;

    /// Rows considered running: no finish time, no verdict, not aborted.
    /// Newest first.
    async fn active(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError>;

    /// Rows reconciliation has to check against the broker: unfinished and
    /// not aborted.
    async fn running(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError>;

    async fn list(
        &self,
        project: &ProjectName,
        filter: HistoryFilter,
        min_time_created: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<WorkflowHistoryRecord>, RepoError>;

    /// Terminal write; returns false when the row was already finished.
    async fn mark_finished(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        succeeded: bool,
        messages: &Value,
    ) -> Result<bool, RepoError>;

    async fn mark_aborted(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        username: &str,
    ) -> Result<(), RepoError>;

    async fn mark_orphaned(
        &self,
        project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<(), RepoError>;

    /// Clears the finisher fields, flipping rows back to running.
    async fn resurrect(&self, project: &ProjectName, ids: &[WorkflowId]) -> Result<(), RepoError>;

    async fn delete(
        &self,
        project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError>;

    async fn all_ids(
        &self,
        project: &ProjectName,
        finished_only: bool,
    ) -> Result<Vec<WorkflowId>, RepoError>;
}

pub struct DbWorkflowHistoryRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbWorkflowHistoryRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }

    async fn id_tasks_query(
        &self,
        project: &ProjectName,
        condition: &str,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError> {
        let rows = sqlx::query(&format!(
            "SELECT id, tasks FROM {} \
             {condition} \
             ORDER BY timeCreated DESC",
            project.qualify("workflowhistory")
        ))
        .fetch_all(self.db_pool.deref())
        .await?;

        rows.into_iter()
            .map(|row| {
                let tasks = parse_tasks(row.get("tasks"))?;
                Ok((WorkflowId(row.get("id")), tasks))
            })
            .collect()
    }
}

const HISTORY_COLUMNS: &str = "id, workflow, \
     launchedBy AS launched_by, abortedBy AS aborted_by, \
     timeCreated AS time_created, timeFinished AS time_finished, \
     succeeded, messages, tasks";

#[async_trait]
impl WorkflowHistoryRepo for DbWorkflowHistoryRepo {
    async fn insert(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        workflow: &Value,
        launched_by: Option<&str>,
    ) -> Result<(), RepoError> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, workflow, launchedBy, timeCreated) \
             VALUES ($1, $2, $3, NOW())",
            project.qualify("workflowhistory")
        ))
        .bind(id.0)
        .bind(workflow)
        .bind(launched_by)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn set_tasks(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        tasks: &[TaskNode],
    ) -> Result<(), RepoError> {
        let tasks = serde_json::to_value(tasks).map_err(RepoError::conversion)?;
        sqlx::query(&format!(
            "UPDATE {} SET tasks = $1 WHERE id = $2",
            project.qualify("workflowhistory")
        ))
        .bind(tasks)
        .bind(id.0)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<WorkflowHistoryRecord>, RepoError> {
        let row: Option<HistoryRow> = sqlx::query_as(&format!(
            "SELECT {HISTORY_COLUMNS} FROM {} WHERE id = $1",
            project.qualify("workflowhistory")
        ))
        .bind(id.0)
        .fetch_optional(self.db_pool.deref())
        .await?;
        row.map(WorkflowHistoryRecord::try_from).transpose()
    }

    async fn get_tasks(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<Vec<TaskNode>>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT tasks FROM {} WHERE id = $1",
            project.qualify("workflowhistory")
        ))
        .bind(id.0)
        .fetch_optional(self.db_pool.deref())
        .await?;
        match row {
            Some(row) => parse_tasks(row.get("tasks")),
            None => Ok(None),
        }
    }

    async fn active(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError> {
        self.id_tasks_query(
            project,
            "WHERE timeFinished IS NULL AND succeeded IS NULL AND abortedBy IS NULL",
        )
        .await
    }

    async fn running(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError> {
        self.id_tasks_query(project, "WHERE timeFinished IS NULL AND abortedBy IS NULL")
            .await
    }

    async fn list(
        &self,
        project: &ProjectName,
        filter: HistoryFilter,
        min_time_created: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<WorkflowHistoryRecord>, RepoError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {HISTORY_COLUMNS} FROM {} WHERE TRUE",
            project.qualify("workflowhistory")
        ));
        match filter {
            HistoryFilter::Both => {}
            HistoryFilter::Running => {
                builder.push(" AND timeFinished IS NULL");
            }
            HistoryFilter::Finished => {
                builder.push(" AND timeFinished IS NOT NULL");
            }
        }
        if let Some(min_time_created) = min_time_created {
            builder.push(" AND timeCreated > ");
            builder.push_bind(min_time_created);
        }
        builder.push(" ORDER BY timeCreated DESC");
        if let Some(limit) = limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }

        let rows: Vec<HistoryRow> = builder
            .build_query_as()
            .fetch_all(self.db_pool.deref())
            .await?;
        rows.into_iter()
            .map(WorkflowHistoryRecord::try_from)
            .collect()
    }

    async fn mark_finished(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        succeeded: bool,
        messages: &Value,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(&format!(
            "UPDATE {} \
             SET timeFinished = NOW(), succeeded = $1, messages = $2 \
             WHERE id = $3 AND timeFinished IS NULL",
            project.qualify("workflowhistory")
        ))
        .bind(succeeded)
        .bind(messages)
        .bind(id.0)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_aborted(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        username: &str,
    ) -> Result<(), RepoError> {
        sqlx::query(&format!(
            "UPDATE {} \
             SET timeFinished = NOW(), succeeded = FALSE, abortedBy = $1 \
             WHERE id = $2 AND timeFinished IS NULL",
            project.qualify("workflowhistory")
        ))
        .bind(username)
        .bind(id.0)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn mark_orphaned(
        &self,
        project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query(&format!(
            "UPDATE {} \
             SET timeFinished = NOW(), succeeded = FALSE, messages = $1 \
             WHERE id = ANY($2) AND timeFinished IS NULL",
            project.qualify("workflowhistory")
        ))
        .bind(Value::String(ORPHANED_MESSAGE.to_string()))
        .bind(&ids)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn resurrect(&self, project: &ProjectName, ids: &[WorkflowId]) -> Result<(), RepoError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query(&format!(
            "UPDATE {} \
             SET timeFinished = NULL, succeeded = NULL, messages = NULL \
             WHERE id = ANY($1)",
            project.qualify("workflowhistory")
        ))
        .bind(&ids)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn delete(
        &self,
        project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ANY($1) RETURNING id",
            project.qualify("workflowhistory")
        ))
        .bind(&ids)
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkflowId(row.get("id")))
            .collect())
    }

    async fn all_ids(
        &self,
        project: &ProjectName,
        finished_only: bool,
    ) -> Result<Vec<WorkflowId>, RepoError> {
        let condition = if finished_only {
            "WHERE timeFinished IS NOT NULL"
        } else {
            ""
        };
        let rows = sqlx::query(&format!(
            "SELECT id FROM {} {condition}",
            project.qualify("workflowhistory")
        ))
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkflowId(row.get("id")))
            .collect())
    }
}
