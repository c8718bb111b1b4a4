use std::collections::BTreeMap;
use std::sync::Arc;

use annolab_common::model::{ModelStateId, ProjectName};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::AiTaskError;
use crate::repo::labeling::{InferenceImageQuery, LabelingRepo, TrainingImageQuery};
use crate::repo::model_state::ModelStateRepo;
use crate::repo::project::{ProjectRepo, SettingUpdate, SettingValue};

/// Model-provided statistics assembled into uniform per-library series;
/// states missing a key carry null at their position.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingStats {
    pub ids: BTreeMap<String, Vec<String>>,
    pub timestamps: BTreeMap<String, Vec<f64>>,
    pub series: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
}

impl TrainingImageQuery {
    /// Builds the query from the kwargs of an
    /// `aicontroller.get_training_images` task.
    pub fn from_task_kwargs(kwargs: &crate::model::Kwargs) -> Result<Self, AiTaskError> {
        let min_timestamp = crate::repo::labeling::MinTimestamp::from_kwarg(
            kwargs.get("minTimestamp"),
        )
        .map_err(AiTaskError::internal)?;
        Ok(TrainingImageQuery {
            min_timestamp,
            include_golden_questions: kwargs
                .get("includeGoldenQuestions")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            min_anno_per_image: kwargs.get("minNumAnnoPerImage").and_then(Value::as_i64),
            max_num_images: kwargs.get("maxNumImages").and_then(Value::as_i64),
        })
    }
}

impl InferenceImageQuery {
    /// Builds the query from the kwargs of an
    /// `aicontroller.get_inference_images` task.
    pub fn from_task_kwargs(kwargs: &crate::model::Kwargs) -> Self {
        InferenceImageQuery {
            force_unlabeled: kwargs
                .get("forceUnlabeled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            golden_questions_only: kwargs
                .get("goldenQuestionsOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            max_num_images: kwargs.get("maxNumImages").and_then(Value::as_i64),
        }
    }
}

/// Splits an image list into similarly-sized chunks for distribution
/// across workers.
pub fn split_chunks(images: Vec<Uuid>, num_chunks: usize) -> Vec<Vec<Uuid>> {
    if num_chunks <= 1 || images.is_empty() {
        return vec![images];
    }
    let chunk_size = (images.len() / num_chunks).max(1);
    images
        .chunks(chunk_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Handlers behind the `aicontroller.*` queue tasks: image selection for
/// training and inference, and the model-state maintenance operations the
/// controller delegates.
pub struct ControlTasks {
    project_repo: Arc<dyn ProjectRepo>,
    labeling_repo: Arc<dyn LabelingRepo>,
    model_state_repo: Arc<dyn ModelStateRepo>,
}

impl ControlTasks {
    pub fn new(
        project_repo: Arc<dyn ProjectRepo>,
        labeling_repo: Arc<dyn LabelingRepo>,
        model_state_repo: Arc<dyn ModelStateRepo>,
    ) -> Self {
        ControlTasks {
            project_repo,
            labeling_repo,
            model_state_repo,
        }
    }

    /// Latest images eligible for training, split into worker chunks.
    pub async fn get_training_images(
        &self,
        project: &ProjectName,
        query: TrainingImageQuery,
        num_workers: usize,
    ) -> Result<Vec<Vec<Uuid>>, AiTaskError> {
        let images = self.labeling_repo.training_images(project, &query).await?;
        info!(
            project = %project,
            num_images = images.len(),
            "Assembled training images"
        );
        Ok(split_chunks(images, num_workers))
    }

    /// Images to run inference on, split into worker chunks. Falls back to
    /// the project's inference cap when no limit is given.
    pub async fn get_inference_images(
        &self,
        project: &ProjectName,
        mut query: InferenceImageQuery,
        num_workers: usize,
    ) -> Result<Vec<Vec<Uuid>>, AiTaskError> {
        if query.max_num_images.unwrap_or(0) <= 0 {
            let defaults = self
                .project_repo
                .get_workflow_defaults(project)
                .await?
                .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
            query.max_num_images = defaults.max_num_images_inference;
        }
        let images = self.labeling_repo.inference_images(project, &query).await?;
        Ok(split_chunks(images, num_workers))
    }

    /// Deletes model states and their predictions; returns the ids that
    /// could not be resolved.
    pub async fn delete_model_states(
        &self,
        project: &ProjectName,
        model_state_ids: &[String],
    ) -> Result<Vec<String>, AiTaskError> {
        let mut invalid = Vec::new();
        let mut ids = Vec::new();
        for raw in model_state_ids {
            match Uuid::parse_str(raw) {
                Ok(uuid) => ids.push(ModelStateId(uuid)),
                Err(_) => invalid.push(raw.clone()),
            }
        }
        let not_found = self.model_state_repo.delete(project, &ids).await?;
        invalid.extend(not_found.iter().map(ModelStateId::to_string));
        Ok(invalid)
    }

    /// Copies a model state so the copy becomes the latest state. When the
    /// source state was produced by a different library than the project's
    /// current one, the project is switched to that library and its stored
    /// settings are cleared.
    pub async fn duplicate_model_state(
        &self,
        project: &ProjectName,
        model_state_id: ModelStateId,
        skip_if_latest: bool,
    ) -> Result<ModelStateId, AiTaskError> {
        let library = self
            .model_state_repo
            .library_of(project, model_state_id)
            .await?
            .ok_or_else(|| AiTaskError::UnknownModelState(model_state_id.to_string()))?;

        if skip_if_latest {
            let latest = self.model_state_repo.latest_id(project).await?;
            if latest == Some(model_state_id) {
                return Ok(model_state_id);
            }
        }

        let current = self
            .project_repo
            .get(project)
            .await?
            .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
        if current.ai_model_library.as_deref() != Some(library.as_str()) {
            self.project_repo
                .update_ai_settings(
                    project,
                    &[
                        SettingUpdate {
                            column: "ai_model_library",
                            value: SettingValue::Text(Some(library.clone())),
                        },
                        SettingUpdate {
                            column: "ai_model_settings",
                            value: SettingValue::Json(None),
                        },
                    ],
                )
                .await?;
        }

        self.model_state_repo
            .duplicate(project, model_state_id)
            .await?
            .ok_or_else(|| {
                AiTaskError::internal(format!(
                    "An unknown error occurred trying to duplicate model state \"{model_state_id}\""
                ))
            })
    }

    /// Assembles per-library statistics series over the stored model
    /// states.
    pub async fn get_model_training_statistics(
        &self,
        project: &ProjectName,
        model_state_ids: Option<&[ModelStateId]>,
        model_libraries: Option<&[String]>,
        skip_imported_models: bool,
    ) -> Result<TrainingStats, AiTaskError> {
        let rows = self
            .model_state_repo
            .stats_rows(project, model_state_ids, model_libraries, skip_imported_models)
            .await?;
        if rows.is_empty() {
            return Ok(TrainingStats::default());
        }

        let mut stats = TrainingStats::default();
        let mut raw: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for row in &rows {
            let library = row.model_library.clone().unwrap_or_default();
            stats
                .ids
                .entry(library.clone())
                .or_default()
                .push(row.id.to_string());
            stats
                .timestamps
                .entry(library.clone())
                .or_default()
                .push(row.time_created);
            let entry = raw.entry(library.clone()).or_default();
            let value = row.stats.clone().unwrap_or(Value::Null);
            if let Value::Object(map) = &value {
                let known = keys.entry(library).or_default();
                for key in map.keys() {
                    if !known.contains(key) {
                        known.push(key.clone());
                    }
                }
            }
            entry.push(value);
        }

        for (library, values) in raw {
            let library_keys = keys.remove(&library).unwrap_or_default();
            let mut series: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for key in &library_keys {
                let column = values
                    .iter()
                    .map(|value| value.get(key).cloned().unwrap_or(Value::Null))
                    .collect();
                series.insert(key.clone(), column);
            }
            stats.series.insert(library, series);
        }
        Ok(stats)
    }
}
