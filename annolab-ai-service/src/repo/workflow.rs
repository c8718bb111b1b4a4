use std::ops::Deref;
use std::sync::Arc;

use annolab_common::model::{ProjectName, WorkflowId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use crate::model::SavedWorkflowRecord;
use crate::repo::{RepoError, ADMIN_SCHEMA};

#[derive(sqlx::FromRow, Debug, Clone)]
struct SavedWorkflowRow {
    id: Uuid,
    name: String,
    workflow: Value,
    username: String,
    time_created: DateTime<Utc>,
    time_modified: DateTime<Utc>,
}

impl From<SavedWorkflowRow> for SavedWorkflowRecord {
    fn from(row: SavedWorkflowRow) -> Self {
        SavedWorkflowRecord {
            id: WorkflowId(row.id),
            name: row.name,
            workflow: row.workflow,
            username: row.username,
            time_created: row.time_created,
            time_modified: row.time_modified,
        }
    }
}

/// Saved (reusable) workflow definitions in `<project>.workflow`.
#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    async fn get(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<SavedWorkflowRecord>, RepoError>;

    async fn list(&self, project: &ProjectName) -> Result<Vec<SavedWorkflowRecord>, RepoError>;

    /// Existing workflow with the given name, or (when provided) id.
    async fn find_existing(
        &self,
        project: &ProjectName,
        name: &str,
        id: Option<WorkflowId>,
    ) -> Result<Option<WorkflowId>, RepoError>;

    async fn insert(
        &self,
        project: &ProjectName,
        name: &str,
        workflow: &Value,
        username: &str,
    ) -> Result<WorkflowId, RepoError>;

    async fn update(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        name: &str,
        workflow: &Value,
    ) -> Result<WorkflowId, RepoError>;

    /// Deletes the given workflows when owned by the user or by a
    /// superuser; returns the ids actually deleted.
    async fn delete_owned(
        &self,
        project: &ProjectName,
        username: &str,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError>;
}

pub struct DbWorkflowRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbWorkflowRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

const SAVED_WORKFLOW_COLUMNS: &str =
    "id, name, workflow, username, timeCreated AS time_created, timeModified AS time_modified";

#[async_trait]
impl WorkflowRepo for DbWorkflowRepo {
    async fn get(
        &self,
        project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<SavedWorkflowRecord>, RepoError> {
        let row: Option<SavedWorkflowRow> = sqlx::query_as(&format!(
            "SELECT {SAVED_WORKFLOW_COLUMNS} FROM {} WHERE id = $1",
            project.qualify("workflow")
        ))
        .bind(id.0)
        .fetch_optional(self.db_pool.deref())
        .await?;
        Ok(row.map(SavedWorkflowRecord::from))
    }

    async fn list(&self, project: &ProjectName) -> Result<Vec<SavedWorkflowRecord>, RepoError> {
        let rows: Vec<SavedWorkflowRow> = sqlx::query_as(&format!(
            "SELECT {SAVED_WORKFLOW_COLUMNS} FROM {} ORDER BY timeCreated DESC",
            project.qualify("workflow")
        ))
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows.into_iter().map(SavedWorkflowRecord::from).collect())
    }

    async fn find_existing(
        &self,
        project: &ProjectName,
        name: &str,
        id: Option<WorkflowId>,
    ) -> Result<Option<WorkflowId>, RepoError> {
        let row = match id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT id FROM {} WHERE name = $1 OR id = $2 LIMIT 1",
                    project.qualify("workflow")
                ))
                .bind(name)
                .bind(id.0)
                .fetch_optional(self.db_pool.deref())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT id FROM {} WHERE name = $1 LIMIT 1",
                    project.qualify("workflow")
                ))
                .bind(name)
                .fetch_optional(self.db_pool.deref())
                .await?
            }
        };
        Ok(row.map(|row| WorkflowId(row.get("id"))))
    }

    async fn insert(
        &self,
        project: &ProjectName,
        name: &str,
        workflow: &Value,
        username: &str,
    ) -> Result<WorkflowId, RepoError> {
        let id = WorkflowId::new_v4();
        sqlx::query(&format!(
            "INSERT INTO {} (id, name, workflow, username, timeCreated, timeModified) \
             VALUES ($1, $2, $3, $4, NOW(), NOW())",
            project.qualify("workflow")
        ))
        .bind(id.0)
        .bind(name)
        .bind(workflow)
        .bind(username)
        .execute(self.db_pool.deref())
        .await?;
        Ok(id)
    }

    async fn update(
        &self,
        project: &ProjectName,
        id: WorkflowId,
        name: &str,
        workflow: &Value,
    ) -> Result<WorkflowId, RepoError> {
        let row = sqlx::query(&format!(
            "UPDATE {} \
             SET name = $1, workflow = $2, timeModified = NOW() \
             WHERE id = $3 \
             RETURNING id",
            project.qualify("workflow")
        ))
        .bind(name)
        .bind(workflow)
        .bind(id.0)
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(WorkflowId(row.get("id")))
    }

    async fn delete_owned(
        &self,
        project: &ProjectName,
        username: &str,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(&format!(
            "DELETE FROM {} \
             WHERE ( \
                 username = $1 \
                 OR username IN ( \
                     SELECT name FROM {ADMIN_SCHEMA}.\"user\" WHERE isSuperUser = TRUE \
                 ) \
             ) \
             AND id = ANY($2) \
             RETURNING id",
            project.qualify("workflow")
        ))
        .bind(username)
        .bind(&ids)
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| WorkflowId(row.get("id")))
            .collect())
    }
}
