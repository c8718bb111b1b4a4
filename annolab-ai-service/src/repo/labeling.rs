use std::ops::Deref;
use std::sync::Arc;

use annolab_common::model::ProjectName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::model::LabelClassRow;
use crate::repo::RepoError;

/// Lower bound on image activity for training-image selection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum MinTimestamp {
    /// Since the most recent model state's creation time; everything when
    /// no state exists yet.
    #[default]
    LastState,
    /// No lower bound.
    Unrestricted,
    At(DateTime<Utc>),
}

impl MinTimestamp {
    /// Parses the `min_timestamp` workflow kwarg: `"lastState"`, null,
    /// an epoch number, or an RFC 3339 timestamp.
    pub fn from_kwarg(value: Option<&Value>) -> Result<Self, String> {
        match value {
            None | Some(Value::Null) => Ok(MinTimestamp::Unrestricted),
            Some(Value::String(s)) if s == "lastState" => Ok(MinTimestamp::LastState),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| MinTimestamp::At(t.with_timezone(&Utc)))
                .map_err(|err| format!("Unrecognized min_timestamp \"{s}\": {err}")),
            Some(Value::Number(n)) => {
                let secs = n.as_f64().unwrap_or(0.0);
                DateTime::from_timestamp(secs as i64, 0)
                    .map(MinTimestamp::At)
                    .ok_or_else(|| format!("Out-of-range min_timestamp: {n}"))
            }
            Some(other) => Err(format!("Unrecognized min_timestamp: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingImageQuery {
    pub min_timestamp: MinTimestamp,
    pub include_golden_questions: bool,
    pub min_anno_per_image: Option<i64>,
    pub max_num_images: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct InferenceImageQuery {
    pub force_unlabeled: bool,
    pub golden_questions_only: bool,
    pub max_num_images: Option<i64>,
}

/// Read-only queries over the labeling tables: annotation-progress counts
/// for the watchdog, image selection for training and inference, and the
/// label-class lookups of the settings updates.
#[async_trait]
pub trait LabelingRepo: Send + Sync {
    /// Number of non-corrupt images screened since the most recent model
    /// state, counting only images with more than `min_anno_per_image`
    /// annotations when that is positive.
    async fn annotated_image_count(
        &self,
        project: &ProjectName,
        min_anno_per_image: i64,
    ) -> Result<i64, RepoError>;

    async fn training_images(
        &self,
        project: &ProjectName,
        query: &TrainingImageQuery,
    ) -> Result<Vec<Uuid>, RepoError>;

    async fn inference_images(
        &self,
        project: &ProjectName,
        query: &InferenceImageQuery,
    ) -> Result<Vec<Uuid>, RepoError>;

    async fn label_classes(&self, project: &ProjectName) -> Result<Vec<LabelClassRow>, RepoError>;

    async fn insert_label_class(
        &self,
        project: &ProjectName,
        class: &LabelClassRow,
    ) -> Result<(), RepoError>;
}

pub struct DbLabelingRepo {
    db_pool: Arc<Pool<Postgres>>,
}

impl DbLabelingRepo {
    pub fn new(db_pool: Arc<Pool<Postgres>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl LabelingRepo for DbLabelingRepo {
    async fn annotated_image_count(
        &self,
        project: &ProjectName,
        min_anno_per_image: i64,
    ) -> Result<i64, RepoError> {
        let image_user = project.qualify("image_user");
        let image = project.qualify("image");
        let annotation = project.qualify("annotation");
        let cnnstate = project.qualify("cnnstate");

        let min_anno_clause = if min_anno_per_image > 0 {
            format!(
                "AND iu.image IN ( \
                     SELECT cntQ.image FROM ( \
                         SELECT image, COUNT(*) AS cnt FROM {annotation} \
                         GROUP BY image \
                     ) AS cntQ WHERE cntQ.cnt > $1 \
                 )"
            )
        } else {
            String::new()
        };

        let query = format!(
            "SELECT COUNT(image) AS count FROM ( \
                 SELECT iu.image, MAX(iu.last_checked) AS lastChecked \
                 FROM {image_user} AS iu \
                 JOIN ( \
                     SELECT id FROM {image} \
                     WHERE corrupt IS NULL OR corrupt = FALSE \
                 ) AS img \
                 ON iu.image = img.id \
                 WHERE TRUE \
                 {min_anno_clause} \
                 GROUP BY iu.image \
             ) AS query \
             WHERE query.lastChecked > ( \
                 SELECT MAX(timeCreated) FROM ( \
                     SELECT to_timestamp(0) AS timeCreated \
                     UNION ( \
                         SELECT MAX(timeCreated) AS timeCreated FROM {cnnstate} \
                     ) \
                 ) AS tsQ \
             )"
        );

        let row = if min_anno_per_image > 0 {
            sqlx::query(&query)
                .bind(min_anno_per_image)
                .fetch_one(self.db_pool.deref())
                .await?
        } else {
            sqlx::query(&query).fetch_one(self.db_pool.deref()).await?
        };
        Ok(row.get::<Option<i64>, _>("count").unwrap_or(0))
    }

    async fn training_images(
        &self,
        project: &ProjectName,
        query: &TrainingImageQuery,
    ) -> Result<Vec<Uuid>, RepoError> {
        let image_user = project.qualify("image_user");
        let image = project.qualify("image");
        let annotation = project.qualify("annotation");
        let cnnstate = project.qualify("cnnstate");

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT newestAnno.image FROM ( \
                 SELECT iu.image, iu.last_checked FROM {image_user} AS iu \
                 JOIN ( \
                     SELECT id AS iid FROM {image} \
                     WHERE (corrupt IS NULL OR corrupt = FALSE)"
        ));
        if !query.include_golden_questions {
            builder.push(" AND isGoldenQuestion IS NOT TRUE");
        }
        builder.push(" ) AS imgQ ON iu.image = imgQ.iid WHERE TRUE");

        match query.min_timestamp {
            MinTimestamp::Unrestricted => {}
            MinTimestamp::LastState => {
                builder.push(format!(
                    " AND iu.last_checked > ( \
                         SELECT COALESCE(MAX(timeCreated), to_timestamp(0)) FROM {cnnstate} \
                     )"
                ));
            }
            MinTimestamp::At(timestamp) => {
                builder.push(" AND iu.last_checked > ");
                builder.push_bind(timestamp);
            }
        }
        if let Some(min_anno) = query.min_anno_per_image {
            if min_anno > 0 {
                builder.push(format!(
                    " AND iu.image IN ( \
                         SELECT image FROM ( \
                             SELECT image, COUNT(*) AS cnt FROM {annotation} \
                             GROUP BY image \
                         ) AS annoCount WHERE annoCount.cnt >= "
                ));
                builder.push_bind(min_anno);
                builder.push(")");
            }
        }
        builder.push(" ORDER BY iu.last_checked ASC");
        if let Some(limit) = query.max_num_images {
            if limit > 0 {
                builder.push(" LIMIT ");
                builder.push_bind(limit);
            }
        }
        builder.push(" ) AS newestAnno");

        let rows = builder.build().fetch_all(self.db_pool.deref()).await?;
        Ok(rows.into_iter().map(|row| row.get("image")).collect())
    }

    async fn inference_images(
        &self,
        project: &ProjectName,
        query: &InferenceImageQuery,
    ) -> Result<Vec<Uuid>, RepoError> {
        let image_user = project.qualify("image_user");
        let image = project.qualify("image");

        let golden_clause = if query.golden_questions_only {
            "WHERE isGoldenQuestion IS TRUE"
        } else {
            ""
        };
        let unlabeled_clause = if query.force_unlabeled {
            "WHERE image_user.viewcount IS NULL \
             AND (image.corrupt IS NULL OR image.corrupt = FALSE)"
        } else {
            "WHERE image.corrupt IS NULL OR image.corrupt = FALSE"
        };

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT query.imageID AS image FROM ( \
                 SELECT image.id AS imageID, image_user.viewcount FROM ( \
                     SELECT * FROM {image} \
                     {golden_clause} \
                 ) AS image \
                 LEFT OUTER JOIN {image_user} \
                 ON image.id = image_user.image \
                 {unlabeled_clause} \
                 ORDER BY image_user.viewcount ASC NULLS FIRST"
        ));
        if let Some(limit) = query.max_num_images {
            if limit > 0 {
                builder.push(" LIMIT ");
                builder.push_bind(limit);
            }
        }
        builder.push(" ) AS query");

        let rows = builder.build().fetch_all(self.db_pool.deref()).await?;
        Ok(rows.into_iter().map(|row| row.get("image")).collect())
    }

    async fn label_classes(&self, project: &ProjectName) -> Result<Vec<LabelClassRow>, RepoError> {
        let rows = sqlx::query(&format!(
            "SELECT name, idx, hidden FROM {}",
            project.qualify("labelclass")
        ))
        .fetch_all(self.db_pool.deref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| LabelClassRow {
                name: row.get("name"),
                idx: row.get("idx"),
                hidden: row.get::<Option<bool>, _>("hidden").unwrap_or(false),
            })
            .collect())
    }

    async fn insert_label_class(
        &self,
        project: &ProjectName,
        class: &LabelClassRow,
    ) -> Result<(), RepoError> {
        sqlx::query(&format!(
            "INSERT INTO {} (name, idx, hidden) VALUES ($1, $2, $3)",
            project.qualify("labelclass")
        ))
        .bind(&class.name)
        .bind(class.idx)
        .bind(class.hidden)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }
}
