use std::ops::Deref;
use std::sync::Arc;

use annolab_common::model::{ModelStateId, ProjectName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::{MarketplaceMeta, ModelStateMeta, ModelStateStatsRow};
use crate::repo::{RepoError, ADMIN_SCHEMA};

#[derive(sqlx::FromRow, Debug, Clone)]
struct ModelStateMetaRow {
    id: Uuid,
    time_created: DateTime<Utc>,
    model_library: Option<String>,
    alcriterion_library: Option<String>,
    num_pred: Option<i64>,
    labelclass_autoupdate: Option<bool>,
    imported_from_marketplace: Option<bool>,
    marketplace_origin_id: Option<Uuid>,
}

impl From<ModelStateMetaRow> for ModelStateMeta {
    fn from(row: ModelStateMetaRow) -> Self {
        ModelStateMeta {
            id: ModelStateId(row.id),
            time_created: row.time_created,
            model_library: row.model_library,
            al_criterion_library: row.alcriterion_library,
            num_pred: row.num_pred.unwrap_or(0),
            labelclass_autoupdate: row.labelclass_autoupdate.unwrap_or(false),
            imported_from_marketplace: row.imported_from_marketplace.unwrap_or(false),
            marketplace_origin_id: row.marketplace_origin_id,
        }
    }
}

/// Stored model artifacts (`<project>.cnnstate`) and the central
/// marketplace metadata attached to their listings.
#[async_trait]
pub trait ModelStateRepo: Send + Sync {
    async fn list_meta(
        &self,
        project: &ProjectName,
        latest_only: bool,
    ) -> Result<Vec<ModelStateMeta>, RepoError>;

    async fn latest_id(&self, project: &ProjectName) -> Result<Option<ModelStateId>, RepoError>;

    /// Creation time of the most recent model state, if any.
    async fn latest_time_created(
        &self,
        project: &ProjectName,
    ) -> Result<Option<DateTime<Utc>>, RepoError>;

    /// Model library of a complete (non-partial) state.
    async fn library_of(
        &self,
        project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<String>, RepoError>;

    /// Copies the state row with a fresh creation time, making the copy the
    /// latest state. Returns the new id, or None when the source is absent.
    async fn duplicate(
        &self,
        project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<ModelStateId>, RepoError>;

    /// Deletes states and their predictions; returns the ids that were not
    /// found.
    async fn delete(
        &self,
        project: &ProjectName,
        ids: &[ModelStateId],
    ) -> Result<Vec<ModelStateId>, RepoError>;

    async fn stats_rows(
        &self,
        project: &ProjectName,
        ids: Option<&[ModelStateId]>,
        libraries: Option<&[String]>,
        skip_imported: bool,
    ) -> Result<Vec<ModelStateStatsRow>, RepoError>;

    /// The `labelclass_autoupdate` flag of the given (or latest) state.
    async fn labelclass_autoupdate(
        &self,
        project: &ProjectName,
        id: Option<ModelStateId>,
    ) -> Result<Option<bool>, RepoError>;

    async fn marketplace_meta(&self) -> Result<Vec<MarketplaceMeta>, RepoError>;
}

pub struct DbModelStateRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbModelStateRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl ModelStateRepo for DbModelStateRepo {
    async fn list_meta(
        &self,
        project: &ProjectName,
        latest_only: bool,
    ) -> Result<Vec<ModelStateMeta>, RepoError> {
        let cnnstate = project.qualify("cnnstate");
        let latest_only_clause = if latest_only {
            format!("WHERE timeCreated = (SELECT MAX(timeCreated) FROM {cnnstate})")
        } else {
            String::new()
        };
        let rows: Vec<ModelStateMetaRow> = sqlx::query_as(&format!(
            "SELECT cnnstate.id, cnnstate.timeCreated AS time_created, \
                    cnnstate.model_library, \
                    cnnstate.alCriterion_library AS alcriterion_library, \
                    pred.num_pred, cnnstate.labelclass_autoupdate, \
                    cnnstate.imported_from_marketplace, cnnstate.marketplace_origin_id \
             FROM ( \
                 SELECT * FROM {cnnstate} \
                 {latest_only_clause} \
             ) AS cnnstate \
             LEFT OUTER JOIN ( \
                 SELECT cnnstate, COUNT(cnnstate) AS num_pred \
                 FROM {} \
                 GROUP BY cnnstate \
             ) AS pred \
             ON cnnstate.id = pred.cnnstate \
             ORDER BY cnnstate.timeCreated DESC",
            project.qualify("prediction")
        ))
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows.into_iter().map(ModelStateMeta::from).collect())
    }

    async fn latest_id(&self, project: &ProjectName) -> Result<Option<ModelStateId>, RepoError> {
        let cnnstate = project.qualify("cnnstate");
        let row = sqlx::query(&format!(
            "SELECT id FROM {cnnstate} \
             WHERE timeCreated = (SELECT MAX(timeCreated) FROM {cnnstate}) \
             LIMIT 1"
        ))
        .fetch_optional(self.db_pool.deref())
        .await?;
        Ok(row.map(|row| ModelStateId(row.get("id"))))
    }

    async fn latest_time_created(
        &self,
        project: &ProjectName,
    ) -> Result<Option<DateTime<Utc>>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT MAX(timeCreated) AS time_created FROM {}",
            project.qualify("cnnstate")
        ))
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(row.get("time_created"))
    }

    async fn library_of(
        &self,
        project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<String>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT model_library FROM {} \
             WHERE id = $1 AND partial = FALSE",
            project.qualify("cnnstate")
        ))
        .bind(id.0)
        .fetch_optional(self.db_pool.deref())
        .await?;
        Ok(row.and_then(|row| row.get("model_library")))
    }

    async fn duplicate(
        &self,
        project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<ModelStateId>, RepoError> {
        let cnnstate = project.qualify("cnnstate");
        let new_id = ModelStateId::new_v4();
        let row = sqlx::query(&format!(
            "INSERT INTO {cnnstate} \
                 (id, model_library, alCriterion_library, timeCreated, stateDict, \
                  stats, partial, marketplace_origin_id, imported_from_marketplace) \
             SELECT $1, model_library, alCriterion_library, NOW(), stateDict, \
                    stats, FALSE, NULL, imported_from_marketplace \
             FROM {cnnstate} \
             WHERE id = $2 \
             RETURNING id"
        ))
        .bind(new_id.0)
        .bind(id.0)
        .fetch_optional(self.db_pool.deref())
        .await?;
        Ok(row.map(|row| ModelStateId(row.get("id"))))
    }

    async fn delete(
        &self,
        project: &ProjectName,
        ids: &[ModelStateId],
    ) -> Result<Vec<ModelStateId>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw_ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        sqlx::query(&format!(
            "DELETE FROM {} WHERE cnnstate = ANY($1)",
            project.qualify("prediction")
        ))
        .bind(&raw_ids)
        .execute(self.db_pool.deref())
        .await?;
        let rows = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ANY($1) RETURNING id",
            project.qualify("cnnstate")
        ))
        .bind(&raw_ids)
        .fetch_all(self.db_pool.deref())
        .await?;

        let deleted: Vec<Uuid> = rows.into_iter().map(|row| row.get("id")).collect();
        Ok(ids
            .iter()
            .filter(|id| !deleted.contains(&id.0))
            .copied()
            .collect())
    }

    async fn stats_rows(
        &self,
        project: &ProjectName,
        ids: Option<&[ModelStateId]>,
        libraries: Option<&[String]>,
        skip_imported: bool,
    ) -> Result<Vec<ModelStateStatsRow>, RepoError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT id, model_library, \
                    EXTRACT(epoch FROM timeCreated)::float8 AS time_created, stats \
             FROM {} WHERE TRUE",
            project.qualify("cnnstate")
        ));
        if let Some(libraries) = libraries {
            builder.push(" AND model_library = ANY(");
            builder.push_bind(libraries.to_vec());
            builder.push(")");
        }
        if let Some(ids) = ids {
            let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
            builder.push(" AND id = ANY(");
            builder.push_bind(ids);
            builder.push(")");
        }
        if skip_imported {
            builder.push(" AND imported_from_marketplace IS FALSE");
        }
        builder.push(" ORDER BY timeCreated ASC");

        let rows = builder.build().fetch_all(self.db_pool.deref()).await?;
        Ok(rows
            .into_iter()
            .map(|row| ModelStateStatsRow {
                id: ModelStateId(row.get("id")),
                model_library: row.get("model_library"),
                time_created: row.get::<Option<f64>, _>("time_created").unwrap_or(0.0),
                stats: row.get("stats"),
            })
            .collect())
    }

    async fn labelclass_autoupdate(
        &self,
        project: &ProjectName,
        id: Option<ModelStateId>,
    ) -> Result<Option<bool>, RepoError> {
        let cnnstate = project.qualify("cnnstate");
        let row = match id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT labelclass_autoupdate FROM {cnnstate} WHERE id = $1"
                ))
                .bind(id.0)
                .fetch_optional(self.db_pool.deref())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT labelclass_autoupdate FROM {cnnstate} \
                     WHERE timeCreated = (SELECT MAX(timeCreated) FROM {cnnstate}) \
                     LIMIT 1"
                ))
                .fetch_optional(self.db_pool.deref())
                .await?
            }
        };
        Ok(row.map(|row| {
            row.get::<Option<bool>, _>("labelclass_autoupdate")
                .unwrap_or(false)
        }))
    }

    async fn marketplace_meta(&self) -> Result<Vec<MarketplaceMeta>, RepoError> {
        let rows = sqlx::query(&format!(
            "SELECT id, origin_uuid, author, anonymous, public, shared, \
                    tags, name, description, citation_info, license \
             FROM {ADMIN_SCHEMA}.modelmarketplace"
        ))
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| MarketplaceMeta {
                id: row.get("id"),
                origin_uuid: row.get("origin_uuid"),
                author: row.get("author"),
                anonymous: row.get("anonymous"),
                public: row.get("public"),
                shared: row.get("shared"),
                tags: row.get("tags"),
                name: row.get("name"),
                description: row.get("description"),
                citation_info: row.get("citation_info"),
                license: row.get("license"),
            })
            .collect())
    }
}
