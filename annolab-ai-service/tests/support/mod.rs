#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use annolab_common::model::{
    AnnotationType, ModelStateId, Project, ProjectName, WorkflowId,
};
use annolab_ai_service::broker::memory::InMemoryBroker;
use annolab_ai_service::config::{ControllerConfig, TaskMonitorConfig, WatchdogConfig};
use annolab_ai_service::model::{
    HistoryFilter, LabelClassRow, MarketplaceMeta, ModelStateMeta, ModelStateStatsRow,
    SavedWorkflowRecord, TaskNode, WorkflowHistoryRecord,
};
use annolab_ai_service::registry::ModelRegistry;
use annolab_ai_service::repo::labeling::{
    InferenceImageQuery, LabelingRepo, TrainingImageQuery,
};
use annolab_ai_service::repo::model_state::ModelStateRepo;
use annolab_ai_service::repo::project::{ProjectRepo, SettingUpdate, SettingValue};
use annolab_ai_service::repo::workflow::WorkflowRepo;
use annolab_ai_service::repo::history::WorkflowHistoryRepo;
use annolab_ai_service::repo::RepoError;
use annolab_ai_service::service::controller::AiController;
use annolab_ai_service::workflow::compiler::ProjectDefaults;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

pub fn project_name() -> ProjectName {
    ProjectName::new("wildlife").unwrap()
}

pub fn test_project() -> Project {
    Project {
        shortname: project_name(),
        annotation_type: AnnotationType::BoundingBoxes,
        prediction_type: AnnotationType::BoundingBoxes,
        ai_model_enabled: true,
        ai_model_library: None,
        ai_model_settings: None,
        ai_alcriterion_library: None,
        ai_alcriterion_settings: None,
        numimages_autotrain: 10,
        minnumannoperimage: 0,
        maxnumimages_train: 0,
        maxnumimages_inference: 0,
        max_num_concurrent_tasks: 2,
        default_workflow: None,
        segmentation_ignore_unlabeled: true,
        labelclass_autoupdate: false,
    }
}

// ---------------------------------------------------------------------------
// project repo fake

pub struct FakeProjectRepo {
    pub projects: Mutex<HashMap<ProjectName, Project>>,
    pub superusers: Mutex<Vec<String>>,
    pub deleted: AtomicBool,
}

impl FakeProjectRepo {
    pub fn with_project(project: Project) -> Arc<Self> {
        let mut projects = HashMap::new();
        projects.insert(project.shortname.clone(), project);
        Arc::new(FakeProjectRepo {
            projects: Mutex::new(projects),
            superusers: Mutex::new(vec!["admin".to_string()]),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn set_default_workflow_id(&self, project: &ProjectName, id: Option<WorkflowId>) {
        let mut projects = self.projects.lock().unwrap();
        if let Some(record) = projects.get_mut(project) {
            record.default_workflow = id;
        }
    }
}

#[async_trait]
impl ProjectRepo for FakeProjectRepo {
    async fn get(&self, project: &ProjectName) -> Result<Option<Project>, RepoError> {
        Ok(self.projects.lock().unwrap().get(project).cloned())
    }

    async fn get_workflow_defaults(
        &self,
        project: &ProjectName,
    ) -> Result<Option<ProjectDefaults>, RepoError> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(project)
            .map(|record| ProjectDefaults {
                min_anno_per_image: Some(i64::from(record.minnumannoperimage)),
                max_num_images_train: Some(i64::from(record.maxnumimages_train)),
                max_num_images_inference: Some(i64::from(record.maxnumimages_inference)),
                ai_model_library: record.ai_model_library.clone(),
            }))
    }

    async fn default_workflow_id(
        &self,
        project: &ProjectName,
    ) -> Result<Option<WorkflowId>, RepoError> {
        Ok(self
            .projects
            .lock()
            .unwrap()
            .get(project)
            .and_then(|record| record.default_workflow))
    }

    async fn set_default_workflow(
        &self,
        project: &ProjectName,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowId>, RepoError> {
        let mut projects = self.projects.lock().unwrap();
        if let Some(record) = projects.get_mut(project) {
            record.default_workflow = Some(workflow_id);
            return Ok(record.default_workflow);
        }
        Ok(None)
    }

    async fn update_ai_settings(
        &self,
        project: &ProjectName,
        updates: &[SettingUpdate],
    ) -> Result<(), RepoError> {
        let mut projects = self.projects.lock().unwrap();
        let Some(record) = projects.get_mut(project) else {
            return Ok(());
        };
        for update in updates {
            match (update.column, &update.value) {
                ("ai_model_enabled", SettingValue::Bool(flag)) => {
                    record.ai_model_enabled = *flag;
                }
                ("ai_model_library", SettingValue::Text(library)) => {
                    record.ai_model_library = library.clone();
                }
                ("ai_model_settings", SettingValue::Json(settings)) => {
                    record.ai_model_settings = settings.clone();
                }
                ("ai_alcriterion_library", SettingValue::Text(library)) => {
                    record.ai_alcriterion_library = library.clone();
                }
                ("numImages_autoTrain", SettingValue::Int(value)) => {
                    record.numimages_autotrain = *value as i32;
                }
                ("minNumAnnoPerImage", SettingValue::Int(value)) => {
                    record.minnumannoperimage = *value as i32;
                }
                ("maxNumImages_train", SettingValue::Int(value)) => {
                    record.maxnumimages_train = *value as i32;
                }
                ("maxNumImages_inference", SettingValue::Int(value)) => {
                    record.maxnumimages_inference = *value as i32;
                }
                ("max_num_concurrent_tasks", SettingValue::Int(value)) => {
                    record.max_num_concurrent_tasks = *value as i32;
                }
                ("segmentation_ignore_unlabeled", SettingValue::Bool(flag)) => {
                    record.segmentation_ignore_unlabeled = *flag;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn set_model_settings(
        &self,
        project: &ProjectName,
        settings: Option<&Value>,
    ) -> Result<(), RepoError> {
        let mut projects = self.projects.lock().unwrap();
        if let Some(record) = projects.get_mut(project) {
            record.ai_model_settings = settings.cloned();
        }
        Ok(())
    }

    async fn set_labelclass_autoupdate(
        &self,
        project: &ProjectName,
        enabled: bool,
    ) -> Result<bool, RepoError> {
        let mut projects = self.projects.lock().unwrap();
        if let Some(record) = projects.get_mut(project) {
            record.labelclass_autoupdate = enabled;
        }
        Ok(enabled)
    }

    async fn is_superuser(&self, username: &str) -> Result<bool, RepoError> {
        Ok(self
            .superusers
            .lock()
            .unwrap()
            .iter()
            .any(|name| name == username))
    }

    async fn project_exists(&self, project: &ProjectName) -> Result<bool, RepoError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.projects.lock().unwrap().contains_key(project))
    }
}

// ---------------------------------------------------------------------------
// saved workflow repo fake

#[derive(Default)]
pub struct FakeWorkflowRepo {
    pub workflows: Mutex<Vec<SavedWorkflowRecord>>,
}

impl FakeWorkflowRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeWorkflowRepo::default())
    }
}

#[async_trait]
impl WorkflowRepo for FakeWorkflowRepo {
    async fn get(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<SavedWorkflowRecord>, RepoError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn list(&self, _project: &ProjectName) -> Result<Vec<SavedWorkflowRecord>, RepoError> {
        Ok(self.workflows.lock().unwrap().clone())
    }

    async fn find_existing(
        &self,
        _project: &ProjectName,
        name: &str,
        id: Option<WorkflowId>,
    ) -> Result<Option<WorkflowId>, RepoError> {
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.name == name || Some(record.id) == id)
            .map(|record| record.id))
    }

    async fn insert(
        &self,
        _project: &ProjectName,
        name: &str,
        workflow: &Value,
        username: &str,
    ) -> Result<WorkflowId, RepoError> {
        let record = SavedWorkflowRecord {
            id: WorkflowId::new_v4(),
            name: name.to_string(),
            workflow: workflow.clone(),
            username: username.to_string(),
            time_created: Utc::now(),
            time_modified: Utc::now(),
        };
        let id = record.id;
        self.workflows.lock().unwrap().push(record);
        Ok(id)
    }

    async fn update(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
        name: &str,
        workflow: &Value,
    ) -> Result<WorkflowId, RepoError> {
        let mut workflows = self.workflows.lock().unwrap();
        if let Some(record) = workflows.iter_mut().find(|record| record.id == id) {
            record.name = name.to_string();
            record.workflow = workflow.clone();
            record.time_modified = Utc::now();
        }
        Ok(id)
    }

    async fn delete_owned(
        &self,
        _project: &ProjectName,
        username: &str,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError> {
        let mut workflows = self.workflows.lock().unwrap();
        let mut deleted = Vec::new();
        workflows.retain(|record| {
            let matches = ids.contains(&record.id) && record.username == username;
            if matches {
                deleted.push(record.id);
            }
            !matches
        });
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// workflow history repo fake

#[derive(Default)]
pub struct FakeHistoryRepo {
    pub rows: Mutex<Vec<WorkflowHistoryRecord>>,
}

impl FakeHistoryRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeHistoryRepo::default())
    }

    pub fn row(&self, id: WorkflowId) -> Option<WorkflowHistoryRecord> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Inserts a running row directly, as if dispatched by an earlier
    /// process incarnation.
    pub fn seed_running(
        &self,
        id: WorkflowId,
        tasks: Option<Vec<TaskNode>>,
        launched_by: Option<&str>,
    ) {
        self.rows.lock().unwrap().push(WorkflowHistoryRecord {
            id,
            workflow: serde_json::json!({"tasks": ["train"]}),
            launched_by: launched_by.map(str::to_string),
            aborted_by: None,
            time_created: Utc::now(),
            time_finished: None,
            succeeded: None,
            messages: None,
            tasks,
        });
    }
}

#[async_trait]
impl WorkflowHistoryRepo for FakeHistoryRepo {
    async fn insert(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
        workflow: &Value,
        launched_by: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        // deterministic ordering even when rows land in the same instant
        let time_created = Utc::now() + ChronoDuration::microseconds(rows.len() as i64);
        rows.push(WorkflowHistoryRecord {
            id,
            workflow: workflow.clone(),
            launched_by: launched_by.map(str::to_string),
            aborted_by: None,
            time_created,
            time_finished: None,
            succeeded: None,
            messages: None,
            tasks: None,
        });
        Ok(())
    }

    async fn set_tasks(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
        tasks: &[TaskNode],
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
            row.tasks = Some(tasks.to_vec());
        }
        Ok(())
    }

    async fn get(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<WorkflowHistoryRecord>, RepoError> {
        Ok(self.row(id))
    }

    async fn get_tasks(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
    ) -> Result<Option<Vec<TaskNode>>, RepoError> {
        Ok(self.row(id).and_then(|row| row.tasks))
    }

    async fn active(
        &self,
        _project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError> {
        let mut rows: Vec<WorkflowHistoryRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.is_running())
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.time_created));
        Ok(rows.into_iter().map(|row| (row.id, row.tasks)).collect())
    }

    async fn running(
        &self,
        _project: &ProjectName,
    ) -> Result<Vec<(WorkflowId, Option<Vec<TaskNode>>)>, RepoError> {
        let mut rows: Vec<WorkflowHistoryRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.time_finished.is_none() && row.aborted_by.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.time_created));
        Ok(rows.into_iter().map(|row| (row.id, row.tasks)).collect())
    }

    async fn list(
        &self,
        _project: &ProjectName,
        filter: HistoryFilter,
        min_time_created: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<WorkflowHistoryRecord>, RepoError> {
        let mut rows: Vec<WorkflowHistoryRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| match filter {
                HistoryFilter::Both => true,
                HistoryFilter::Running => row.time_finished.is_none(),
                HistoryFilter::Finished => row.time_finished.is_some(),
            })
            .filter(|row| {
                min_time_created
                    .map(|min| row.time_created > min)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| std::cmp::Reverse(row.time_created));
        if let Some(limit) = limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn mark_finished(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
        succeeded: bool,
        messages: &Value,
    ) -> Result<bool, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.id == id && row.time_finished.is_none())
        {
            row.time_finished = Some(Utc::now());
            row.succeeded = Some(succeeded);
            row.messages = Some(messages.clone());
            return Ok(true);
        }
        Ok(false)
    }

    async fn mark_aborted(
        &self,
        _project: &ProjectName,
        id: WorkflowId,
        username: &str,
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.id == id && row.time_finished.is_none())
        {
            row.time_finished = Some(Utc::now());
            row.succeeded = Some(false);
            row.aborted_by = Some(username.to_string());
        }
        Ok(())
    }

    async fn mark_orphaned(
        &self,
        _project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if ids.contains(&row.id) && row.time_finished.is_none() {
                row.time_finished = Some(Utc::now());
                row.succeeded = Some(false);
                row.messages = Some(Value::String(
                    annolab_ai_service::repo::history::ORPHANED_MESSAGE.to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn resurrect(
        &self,
        _project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<(), RepoError> {
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            if ids.contains(&row.id) {
                row.time_finished = None;
                row.succeeded = None;
                row.messages = None;
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        _project: &ProjectName,
        ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let mut deleted = Vec::new();
        rows.retain(|row| {
            let matches = ids.contains(&row.id);
            if matches {
                deleted.push(row.id);
            }
            !matches
        });
        Ok(deleted)
    }

    async fn all_ids(
        &self,
        _project: &ProjectName,
        finished_only: bool,
    ) -> Result<Vec<WorkflowId>, RepoError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| !finished_only || row.time_finished.is_some())
            .map(|row| row.id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// model state repo fake

#[derive(Clone)]
pub struct FakeModelState {
    pub meta: ModelStateMeta,
    pub stats: Option<Value>,
    pub partial: bool,
}

#[derive(Default)]
pub struct FakeModelStateRepo {
    pub states: Mutex<Vec<FakeModelState>>,
    pub marketplace: Mutex<Vec<MarketplaceMeta>>,
}

impl FakeModelStateRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeModelStateRepo::default())
    }

    pub fn seed_state(&self, library: &str, age_secs: i64) -> ModelStateId {
        let id = ModelStateId::new_v4();
        self.states.lock().unwrap().push(FakeModelState {
            meta: ModelStateMeta {
                id,
                time_created: Utc::now() - ChronoDuration::seconds(age_secs),
                model_library: Some(library.to_string()),
                al_criterion_library: None,
                num_pred: 0,
                labelclass_autoupdate: false,
                imported_from_marketplace: false,
                marketplace_origin_id: None,
            },
            stats: None,
            partial: false,
        });
        id
    }
}

#[async_trait]
impl ModelStateRepo for FakeModelStateRepo {
    async fn list_meta(
        &self,
        _project: &ProjectName,
        latest_only: bool,
    ) -> Result<Vec<ModelStateMeta>, RepoError> {
        let mut states: Vec<ModelStateMeta> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|state| state.meta.clone())
            .collect();
        states.sort_by_key(|meta| std::cmp::Reverse(meta.time_created));
        if latest_only {
            states.truncate(1);
        }
        Ok(states)
    }

    async fn latest_id(&self, project: &ProjectName) -> Result<Option<ModelStateId>, RepoError> {
        Ok(self.list_meta(project, true).await?.first().map(|meta| meta.id))
    }

    async fn latest_time_created(
        &self,
        project: &ProjectName,
    ) -> Result<Option<DateTime<Utc>>, RepoError> {
        Ok(self
            .list_meta(project, true)
            .await?
            .first()
            .map(|meta| meta.time_created))
    }

    async fn library_of(
        &self,
        _project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<String>, RepoError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .find(|state| state.meta.id == id && !state.partial)
            .and_then(|state| state.meta.model_library.clone()))
    }

    async fn duplicate(
        &self,
        _project: &ProjectName,
        id: ModelStateId,
    ) -> Result<Option<ModelStateId>, RepoError> {
        let mut states = self.states.lock().unwrap();
        let Some(source) = states.iter().find(|state| state.meta.id == id).cloned() else {
            return Ok(None);
        };
        let new_id = ModelStateId::new_v4();
        states.push(FakeModelState {
            meta: ModelStateMeta {
                id: new_id,
                time_created: Utc::now(),
                marketplace_origin_id: None,
                ..source.meta
            },
            stats: source.stats,
            partial: false,
        });
        Ok(Some(new_id))
    }

    async fn delete(
        &self,
        _project: &ProjectName,
        ids: &[ModelStateId],
    ) -> Result<Vec<ModelStateId>, RepoError> {
        let mut states = self.states.lock().unwrap();
        let mut found = Vec::new();
        states.retain(|state| {
            let matches = ids.contains(&state.meta.id);
            if matches {
                found.push(state.meta.id);
            }
            !matches
        });
        Ok(ids
            .iter()
            .filter(|id| !found.contains(id))
            .copied()
            .collect())
    }

    async fn stats_rows(
        &self,
        _project: &ProjectName,
        ids: Option<&[ModelStateId]>,
        libraries: Option<&[String]>,
        skip_imported: bool,
    ) -> Result<Vec<ModelStateStatsRow>, RepoError> {
        let mut states: Vec<FakeModelState> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|state| {
                ids.map(|ids| ids.contains(&state.meta.id)).unwrap_or(true)
                    && libraries
                        .map(|libraries| {
                            state
                                .meta
                                .model_library
                                .as_ref()
                                .map(|library| libraries.contains(library))
                                .unwrap_or(false)
                        })
                        .unwrap_or(true)
                    && (!skip_imported || !state.meta.imported_from_marketplace)
            })
            .cloned()
            .collect();
        states.sort_by_key(|state| state.meta.time_created);
        Ok(states
            .into_iter()
            .map(|state| ModelStateStatsRow {
                id: state.meta.id,
                model_library: state.meta.model_library,
                time_created: state.meta.time_created.timestamp_micros() as f64 / 1e6,
                stats: state.stats,
            })
            .collect())
    }

    async fn labelclass_autoupdate(
        &self,
        project: &ProjectName,
        id: Option<ModelStateId>,
    ) -> Result<Option<bool>, RepoError> {
        let target = match id {
            Some(id) => Some(id),
            None => self.latest_id(project).await?,
        };
        Ok(target.and_then(|id| {
            self.states
                .lock()
                .unwrap()
                .iter()
                .find(|state| state.meta.id == id)
                .map(|state| state.meta.labelclass_autoupdate)
        }))
    }

    async fn marketplace_meta(&self) -> Result<Vec<MarketplaceMeta>, RepoError> {
        Ok(self.marketplace.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// labeling repo fake

#[derive(Default)]
pub struct FakeLabelingRepo {
    pub annotated_count: Mutex<i64>,
    pub training_pool: Mutex<Vec<Uuid>>,
    pub inference_pool: Mutex<Vec<Uuid>>,
    pub classes: Mutex<Vec<LabelClassRow>>,
}

impl FakeLabelingRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeLabelingRepo::default())
    }

    pub fn set_annotated_count(&self, count: i64) {
        *self.annotated_count.lock().unwrap() = count;
    }
}

#[async_trait]
impl LabelingRepo for FakeLabelingRepo {
    async fn annotated_image_count(
        &self,
        _project: &ProjectName,
        _min_anno_per_image: i64,
    ) -> Result<i64, RepoError> {
        Ok(*self.annotated_count.lock().unwrap())
    }

    async fn training_images(
        &self,
        _project: &ProjectName,
        query: &TrainingImageQuery,
    ) -> Result<Vec<Uuid>, RepoError> {
        let mut images = self.training_pool.lock().unwrap().clone();
        if let Some(limit) = query.max_num_images {
            if limit > 0 {
                images.truncate(limit as usize);
            }
        }
        Ok(images)
    }

    async fn inference_images(
        &self,
        _project: &ProjectName,
        query: &InferenceImageQuery,
    ) -> Result<Vec<Uuid>, RepoError> {
        let mut images = self.inference_pool.lock().unwrap().clone();
        if let Some(limit) = query.max_num_images {
            if limit > 0 {
                images.truncate(limit as usize);
            }
        }
        Ok(images)
    }

    async fn label_classes(&self, _project: &ProjectName) -> Result<Vec<LabelClassRow>, RepoError> {
        Ok(self.classes.lock().unwrap().clone())
    }

    async fn insert_label_class(
        &self,
        _project: &ProjectName,
        class: &LabelClassRow,
    ) -> Result<(), RepoError> {
        self.classes.lock().unwrap().push(class.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// wired test environment

pub struct TestEnv {
    pub controller: Arc<AiController>,
    pub broker: Arc<InMemoryBroker>,
    pub project_repo: Arc<FakeProjectRepo>,
    pub workflow_repo: Arc<FakeWorkflowRepo>,
    pub history_repo: Arc<FakeHistoryRepo>,
    pub model_state_repo: Arc<FakeModelStateRepo>,
    pub labeling_repo: Arc<FakeLabelingRepo>,
}

pub fn fast_watchdog_config() -> WatchdogConfig {
    WatchdogConfig {
        min_wait: std::time::Duration::from_millis(20),
        max_wait: std::time::Duration::from_millis(200),
        slice: std::time::Duration::from_millis(10),
    }
}

impl TestEnv {
    pub fn new() -> TestEnv {
        Self::with_project_and_registry(test_project(), ModelRegistry::empty())
    }

    pub fn with_project(project: Project) -> TestEnv {
        Self::with_project_and_registry(project, ModelRegistry::empty())
    }

    pub fn with_project_and_registry(project: Project, registry: ModelRegistry) -> TestEnv {
        let broker = Arc::new(InMemoryBroker::new());
        let project_repo = FakeProjectRepo::with_project(project);
        let workflow_repo = FakeWorkflowRepo::new();
        let history_repo = FakeHistoryRepo::new();
        let model_state_repo = FakeModelStateRepo::new();
        let labeling_repo = FakeLabelingRepo::new();

        let controller = AiController::new(
            ControllerConfig::default(),
            fast_watchdog_config(),
            TaskMonitorConfig {
                interval: std::time::Duration::from_millis(50),
                ..TaskMonitorConfig::default()
            },
            project_repo.clone(),
            workflow_repo.clone(),
            history_repo.clone(),
            model_state_repo.clone(),
            labeling_repo.clone(),
            broker.clone(),
            Arc::new(registry),
        );

        TestEnv {
            controller,
            broker,
            project_repo,
            workflow_repo,
            history_repo,
            model_state_repo,
            labeling_repo,
        }
    }

    pub fn with_workers(self) -> TestEnv {
        self.broker
            .register_worker("worker-0", &["AIController", "AIWorker"]);
        self
    }
}
