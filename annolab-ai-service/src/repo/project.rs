use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use annolab_common::model::{AnnotationType, Project, ProjectName, WorkflowId};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::repo::{RepoError, ADMIN_SCHEMA};
use crate::workflow::compiler::ProjectDefaults;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct ProjectRecord {
    pub shortname: String,
    pub annotation_type: String,
    pub prediction_type: String,
    pub ai_model_enabled: Option<bool>,
    pub ai_model_library: Option<String>,
    pub ai_model_settings: Option<Value>,
    pub ai_alcriterion_library: Option<String>,
    pub ai_alcriterion_settings: Option<Value>,
    pub numimages_autotrain: Option<i32>,
    pub minnumannoperimage: Option<i32>,
    pub maxnumimages_train: Option<i32>,
    pub maxnumimages_inference: Option<i32>,
    pub max_num_concurrent_tasks: Option<i32>,
    pub default_workflow: Option<Uuid>,
    pub segmentation_ignore_unlabeled: Option<bool>,
    pub labelclass_autoupdate: Option<bool>,
}

impl TryFrom<ProjectRecord> for Project {
    type Error = String;

    fn try_from(value: ProjectRecord) -> Result<Self, Self::Error> {
        Ok(Project {
            shortname: ProjectName::new(value.shortname)?,
            annotation_type: AnnotationType::from_str(&value.annotation_type)?,
            prediction_type: AnnotationType::from_str(&value.prediction_type)?,
            ai_model_enabled: value.ai_model_enabled.unwrap_or(false),
            ai_model_library: value.ai_model_library,
            ai_model_settings: value.ai_model_settings,
            ai_alcriterion_library: value.ai_alcriterion_library,
            ai_alcriterion_settings: value.ai_alcriterion_settings,
            // NULL threshold means auto-training was never configured
            numimages_autotrain: value.numimages_autotrain.unwrap_or(-1),
            minnumannoperimage: value.minnumannoperimage.unwrap_or(0),
            maxnumimages_train: value.maxnumimages_train.unwrap_or(0),
            maxnumimages_inference: value.maxnumimages_inference.unwrap_or(0),
            max_num_concurrent_tasks: value.max_num_concurrent_tasks.unwrap_or(0),
            default_workflow: value.default_workflow.map(WorkflowId),
            segmentation_ignore_unlabeled: value.segmentation_ignore_unlabeled.unwrap_or(true),
            labelclass_autoupdate: value.labelclass_autoupdate.unwrap_or(false),
        })
    }
}

/// A single column assignment for the AI-settings update. Columns are
/// whitelisted constants in the controller; values are typed so that each
/// bind matches its column type.
#[derive(Debug, Clone)]
pub struct SettingUpdate {
    pub column: &'static str,
    pub value: SettingValue,
}

#[derive(Debug, Clone)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(Option<String>),
    Json(Option<Value>),
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn get(&self, project: &ProjectName) -> Result<Option<Project>, RepoError>;

    async fn get_workflow_defaults(
        &self,
        project: &ProjectName,
    ) -> Result<Option<ProjectDefaults>, RepoError>;

    async fn default_workflow_id(
        &self,
        project: &ProjectName,
    ) -> Result<Option<WorkflowId>, RepoError>;

    /// Sets the default workflow iff the id exists in the project's saved
    /// workflows; returns the resulting default id.
    async fn set_default_workflow(
        &self,
        project: &ProjectName,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowId>, RepoError>;

    async fn update_ai_settings(
        &self,
        project: &ProjectName,
        updates: &[SettingUpdate],
    ) -> Result<(), RepoError>;

    async fn set_model_settings(
        &self,
        project: &ProjectName,
        settings: Option<&Value>,
    ) -> Result<(), RepoError>;

    async fn set_labelclass_autoupdate(
        &self,
        project: &ProjectName,
        enabled: bool,
    ) -> Result<bool, RepoError>;

    async fn is_superuser(&self, username: &str) -> Result<bool, RepoError>;

    /// Probes whether the project's schema still holds a workflowhistory
    /// table; a vanished schema means the project was deleted.
    async fn project_exists(&self, project: &ProjectName) -> Result<bool, RepoError>;
}

pub struct DbProjectRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbProjectRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

const PROJECT_COLUMNS: &str = "shortname, \
     annotationType AS annotation_type, predictionType AS prediction_type, \
     ai_model_enabled, ai_model_library, ai_model_settings, \
     ai_alcriterion_library, ai_alcriterion_settings, \
     numImages_autoTrain AS numimages_autotrain, \
     minNumAnnoPerImage AS minnumannoperimage, \
     maxNumImages_train AS maxnumimages_train, \
     maxNumImages_inference AS maxnumimages_inference, \
     max_num_concurrent_tasks, default_workflow, \
     segmentation_ignore_unlabeled, labelclass_autoupdate";

#[async_trait]
impl ProjectRepo for DbProjectRepo {
    async fn get(&self, project: &ProjectName) -> Result<Option<Project>, RepoError> {
        let record: Option<ProjectRecord> = sqlx::query_as(&format!(
            "SELECT {PROJECT_COLUMNS} FROM {ADMIN_SCHEMA}.project WHERE shortname = $1"
        ))
        .bind(project.as_str())
        .fetch_optional(self.db_pool.deref())
        .await?;

        record
            .map(|record| Project::try_from(record).map_err(RepoError::conversion))
            .transpose()
    }

    async fn get_workflow_defaults(
        &self,
        project: &ProjectName,
    ) -> Result<Option<ProjectDefaults>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT minNumAnnoPerImage AS min_anno, \
                    maxNumImages_train AS max_train, \
                    maxNumImages_inference AS max_inference, \
                    ai_model_library \
             FROM {ADMIN_SCHEMA}.project WHERE shortname = $1"
        ))
        .bind(project.as_str())
        .fetch_optional(self.db_pool.deref())
        .await?;

        Ok(row.map(|row| ProjectDefaults {
            min_anno_per_image: row.get::<Option<i32>, _>("min_anno").map(i64::from),
            max_num_images_train: row.get::<Option<i32>, _>("max_train").map(i64::from),
            max_num_images_inference: row.get::<Option<i32>, _>("max_inference").map(i64::from),
            ai_model_library: row.get("ai_model_library"),
        }))
    }

    async fn default_workflow_id(
        &self,
        project: &ProjectName,
    ) -> Result<Option<WorkflowId>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT default_workflow FROM {ADMIN_SCHEMA}.project WHERE shortname = $1"
        ))
        .bind(project.as_str())
        .fetch_optional(self.db_pool.deref())
        .await?;

        Ok(row
            .and_then(|row| row.get::<Option<Uuid>, _>("default_workflow"))
            .map(WorkflowId))
    }

    async fn set_default_workflow(
        &self,
        project: &ProjectName,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowId>, RepoError> {
        let query = format!(
            "UPDATE {ADMIN_SCHEMA}.project \
             SET default_workflow = ( \
                 SELECT id FROM {} WHERE id = $1 LIMIT 1 \
             ) \
             WHERE shortname = $2 \
             RETURNING default_workflow",
            project.qualify("workflow")
        );
        let row = sqlx::query(&query)
            .bind(workflow_id.0)
            .bind(project.as_str())
            .fetch_optional(self.db_pool.deref())
            .await?;

        Ok(row
            .and_then(|row| row.get::<Option<Uuid>, _>("default_workflow"))
            .map(WorkflowId))
    }

    async fn update_ai_settings(
        &self,
        project: &ProjectName,
        updates: &[SettingUpdate],
    ) -> Result<(), RepoError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("UPDATE {ADMIN_SCHEMA}.project SET "));
        let mut separated = builder.separated(", ");
        for update in updates {
            separated.push(format!("{} = ", update.column));
            match &update.value {
                SettingValue::Bool(value) => separated.push_bind_unseparated(*value),
                SettingValue::Int(value) => separated.push_bind_unseparated(*value),
                SettingValue::Text(value) => separated.push_bind_unseparated(value.clone()),
                SettingValue::Json(value) => separated.push_bind_unseparated(value.clone()),
            };
        }
        builder.push(" WHERE shortname = ");
        builder.push_bind(project.as_str());
        builder.build().execute(self.db_pool.deref()).await?;
        Ok(())
    }

    async fn set_model_settings(
        &self,
        project: &ProjectName,
        settings: Option<&Value>,
    ) -> Result<(), RepoError> {
        sqlx::query(&format!(
            "UPDATE {ADMIN_SCHEMA}.project SET ai_model_settings = $1 WHERE shortname = $2"
        ))
        .bind(settings)
        .bind(project.as_str())
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn set_labelclass_autoupdate(
        &self,
        project: &ProjectName,
        enabled: bool,
    ) -> Result<bool, RepoError> {
        let row = sqlx::query(&format!(
            "UPDATE {ADMIN_SCHEMA}.project \
             SET labelclass_autoupdate = $1 \
             WHERE shortname = $2 \
             RETURNING labelclass_autoupdate"
        ))
        .bind(enabled)
        .bind(project.as_str())
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(row.get("labelclass_autoupdate"))
    }

    async fn is_superuser(&self, username: &str) -> Result<bool, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT EXISTS ( \
                 SELECT 1 FROM {ADMIN_SCHEMA}.\"user\" \
                 WHERE name = $1 AND isSuperUser = TRUE \
             ) AS is_superuser"
        ))
        .bind(username)
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(row.get("is_superuser"))
    }

    async fn project_exists(&self, project: &ProjectName) -> Result<bool, RepoError> {
        let row = sqlx::query(
            "SELECT EXISTS ( \
                 SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = 'workflowhistory' \
             ) AS present",
        )
        .bind(project.as_str())
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(row.get("present"))
    }
}
