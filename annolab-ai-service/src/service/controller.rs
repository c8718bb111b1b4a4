use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use annolab_common::model::{ModelStateId, ProjectName, TaskId, WorkflowId};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, WorkerSnapshot};
use crate::config::{ControllerConfig, TaskMonitorConfig, WatchdogConfig};
use crate::error::AiTaskError;
use crate::model::{
    HistorySelector, Kwargs, MarketplaceMeta, SavedWorkflowMeta, TaskHistoryReport,
    WorkflowDocument,
};
use crate::registry::{ModelDescriptor, ModelRegistry, OptionsVerdict};
use crate::repo::history::WorkflowHistoryRepo;
use crate::repo::labeling::LabelingRepo;
use crate::repo::model_state::ModelStateRepo;
use crate::repo::project::{ProjectRepo, SettingUpdate, SettingValue};
use crate::repo::workflow::WorkflowRepo;
use crate::service::dispatcher::TaskDispatcher;
use crate::service::task_monitor::TaskMonitor;
use crate::service::tracker::WorkflowTracker;
use crate::service::watchdog::AnnotationWatchdog;
use crate::workflow::compiler::WorkflowCompiler;
use crate::workflow::graph::{
    task_names, TaskGraph, TaskSignature, QUEUE_AI_CONTROLLER, QUEUE_AI_WORKER,
};

/// Workflow argument of `launch_task`: a saved workflow id, the project's
/// default workflow, or an inline document.
#[derive(Debug, Clone)]
pub enum WorkflowRef {
    Default,
    Id(WorkflowId),
    Document(WorkflowDocument),
}

impl WorkflowRef {
    /// Parses the string form callers submit: `"default"`, a JSON
    /// document, or a workflow UUID.
    pub fn parse(raw: &str) -> Result<WorkflowRef, AiTaskError> {
        if raw.eq_ignore_ascii_case("default") {
            return Ok(WorkflowRef::Default);
        }
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            if value.is_object() {
                let document =
                    WorkflowDocument::from_json(&value).map_err(AiTaskError::invalid_workflow)?;
                return Ok(WorkflowRef::Document(document));
            }
        }
        match Uuid::parse_str(raw) {
            Ok(uuid) => Ok(WorkflowRef::Id(WorkflowId(uuid))),
            Err(_) => Err(AiTaskError::UnknownWorkflow(format!(
                "\"{raw}\" is not a valid workflow ID"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusQuery {
    pub project: bool,
    pub tasks: bool,
    pub workers: bool,
    pub nudge_watchdog: bool,
    pub recheck_autotrain_settings: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub ai_auto_training_enabled: bool,
    pub num_annotated: i64,
    pub num_next_training: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskHistoryReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingInfoWorkers {
    #[serde(rename = "AIController")]
    pub ai_controller: Vec<String>,
    #[serde(rename = "AIWorker")]
    pub ai_worker: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingInfo {
    pub ai_model_library: Option<String>,
    pub workers: TrainingInfoWorkers,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableModels {
    pub prediction: BTreeMap<String, ModelDescriptor>,
    pub ranking: BTreeMap<String, ModelDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStateListing {
    pub id: String,
    pub time_created: f64,
    pub model_library: LibraryRef,
    pub al_criterion_library: LibraryRef,
    pub num_pred: i64,
    pub labelclass_autoupdate: bool,
    pub imported_from_marketplace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marketplace_info: Option<MarketplaceMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelclassAutoadaptInfo {
    pub model: bool,
    pub model_lib: bool,
    pub project: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SettingsUpdateOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_model_settings_status: Option<OptionsVerdict>,
}

fn as_bool(key: &str, value: &Value) -> Result<bool, AiTaskError> {
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => Ok(number.as_i64().unwrap_or(0) != 0),
        Value::String(text) => match text.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(AiTaskError::internal(format!(
                "Invalid value for \"{key}\": expected a boolean"
            ))),
        },
        _ => Err(AiTaskError::internal(format!(
            "Invalid value for \"{key}\": expected a boolean"
        ))),
    }
}

fn as_int(key: &str, value: &Value) -> Result<Option<i64>, AiTaskError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number.as_i64().map(Some).ok_or_else(|| {
            AiTaskError::internal(format!("Invalid value for \"{key}\": expected an integer"))
        }),
        Value::String(text) if text.trim().is_empty() => Ok(None),
        Value::String(text) => text.trim().parse::<i64>().map(Some).map_err(|_| {
            AiTaskError::internal(format!("Invalid value for \"{key}\": expected an integer"))
        }),
        _ => Err(AiTaskError::internal(format!(
            "Invalid value for \"{key}\": expected an integer"
        ))),
    }
}

fn as_opt_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    }
}

/// Entry point for callers: admission control, workflow launch and
/// revocation, status reporting, model-state and saved-workflow
/// management, AI model settings. One annotation watchdog per project is
/// started lazily from here.
pub struct AiController {
    controller_config: ControllerConfig,
    watchdog_config: WatchdogConfig,
    project_repo: Arc<dyn ProjectRepo>,
    workflow_repo: Arc<dyn WorkflowRepo>,
    model_state_repo: Arc<dyn ModelStateRepo>,
    labeling_repo: Arc<dyn LabelingRepo>,
    broker: Arc<dyn BrokerClient>,
    registry: Arc<ModelRegistry>,
    compiler: WorkflowCompiler,
    tracker: Arc<WorkflowTracker>,
    dispatcher: TaskDispatcher,
    task_monitor: TaskMonitor,
    watchdogs: RwLock<HashMap<ProjectName, AnnotationWatchdog>>,
}

impl AiController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller_config: ControllerConfig,
        watchdog_config: WatchdogConfig,
        task_monitor_config: TaskMonitorConfig,
        project_repo: Arc<dyn ProjectRepo>,
        workflow_repo: Arc<dyn WorkflowRepo>,
        history_repo: Arc<dyn WorkflowHistoryRepo>,
        model_state_repo: Arc<dyn ModelStateRepo>,
        labeling_repo: Arc<dyn LabelingRepo>,
        broker: Arc<dyn BrokerClient>,
        registry: Arc<ModelRegistry>,
    ) -> Arc<Self> {
        let tracker = Arc::new(WorkflowTracker::new(history_repo.clone(), broker.clone()));
        let compiler =
            WorkflowCompiler::new(project_repo.clone(), broker.clone(), registry.clone());
        let dispatcher =
            TaskDispatcher::new(history_repo.clone(), broker.clone(), tracker.clone());
        let task_monitor = TaskMonitor::spawn(broker.clone(), task_monitor_config);

        Arc::new(AiController {
            controller_config,
            watchdog_config,
            project_repo,
            workflow_repo,
            model_state_repo,
            labeling_repo,
            broker,
            registry,
            compiler,
            tracker,
            dispatcher,
            task_monitor,
            watchdogs: RwLock::new(HashMap::new()),
        })
    }

    pub fn tracker(&self) -> &Arc<WorkflowTracker> {
        &self.tracker
    }

    // ----- admission -----------------------------------------------------

    /// Whether one more task may be launched. Auto-launched tasks are
    /// refused whenever any AI task is already running for the project;
    /// user launches are bounded by the project cap under the global
    /// ceiling (non-positive caps mean unlimited).
    pub async fn can_launch_task(
        &self,
        project: &ProjectName,
        auto_launched: bool,
    ) -> Result<bool, AiTaskError> {
        if let Err(reconcile_error) = self.tracker.reconcile(project).await {
            warn!(project = %project, "Reconciliation before launch failed: {reconcile_error}");
        }
        let running = self.tracker.active_ids(project).await?;
        if auto_launched && !running.is_empty() {
            return Ok(false);
        }

        let record = self
            .project_repo
            .get(project)
            .await?
            .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
        let ceiling = i64::from(self.controller_config.max_num_concurrent_tasks);
        let mut cap = i64::from(record.max_num_concurrent_tasks);
        if ceiling > 0 {
            cap = cap.min(ceiling);
        }
        if cap <= 0 {
            return Ok(true);
        }
        Ok((running.len() as i64) < cap)
    }

    async fn resolve_workflow(
        &self,
        project: &ProjectName,
        workflow: WorkflowRef,
    ) -> Result<WorkflowDocument, AiTaskError> {
        let id = match workflow {
            WorkflowRef::Document(document) => return Ok(document),
            WorkflowRef::Id(id) => id,
            WorkflowRef::Default => self
                .project_repo
                .default_workflow_id(project)
                .await?
                .ok_or_else(|| {
                    AiTaskError::UnknownWorkflow("no default workflow set".to_string())
                })?,
        };
        let record = self
            .workflow_repo
            .get(project, id)
            .await?
            .ok_or_else(|| AiTaskError::UnknownWorkflow(id.to_string()))?;
        WorkflowDocument::from_json(&record.workflow).map_err(AiTaskError::invalid_workflow)
    }

    /// Compiles and dispatches a workflow, subject to admission. A null
    /// author denotes an auto-launch.
    pub async fn launch_task(
        &self,
        project: &ProjectName,
        workflow: WorkflowRef,
        author: Option<&str>,
    ) -> Result<WorkflowId, AiTaskError> {
        if !self.can_launch_task(project, author.is_none()).await? {
            return Err(AiTaskError::admission_refused(format!(
                "The maximum allowed number of concurrent tasks has been reached for \
                 project \"{project}\". Please wait until running tasks are finished."
            )));
        }
        let document = self.resolve_workflow(project, workflow).await?;
        let compiled = self.compiler.compile(project, &document).await?;
        self.dispatcher
            .launch(project, &compiled.graph, &document, author)
            .await
    }

    pub async fn revoke_task(
        &self,
        project: &ProjectName,
        workflow_id: WorkflowId,
        username: &str,
    ) -> Result<(), AiTaskError> {
        self.tracker.revoke(username, project, workflow_id).await
    }

    pub async fn revoke_all_tasks(
        &self,
        project: &ProjectName,
        username: &str,
    ) -> Result<(), AiTaskError> {
        for workflow_id in self.tracker.active_ids(project).await? {
            self.tracker.revoke(username, project, workflow_id).await?;
        }
        Ok(())
    }

    // ----- watchdogs and status ------------------------------------------

    async fn init_watchdog(
        self: &Arc<Self>,
        project: &ProjectName,
        nudge: bool,
        recheck: bool,
    ) -> Result<(), AiTaskError> {
        let mut watchdogs = self.watchdogs.write().await;
        let needs_spawn = watchdogs
            .get(project)
            .map(AnnotationWatchdog::stopped)
            .unwrap_or(true);
        if needs_spawn {
            let watchdog = AnnotationWatchdog::spawn(
                project.clone(),
                self.watchdog_config.clone(),
                self.controller_config.clone(),
                self.project_repo.clone(),
                self.labeling_repo.clone(),
                self.tracker.clone(),
                self.broker.clone(),
                Arc::downgrade(self),
            );
            watchdogs.insert(project.clone(), watchdog);
        }
        let watchdog = watchdogs
            .get(project)
            .expect("watchdog was inserted above");
        if recheck {
            watchdog.recheck_autotrain_settings();
        } else if nudge {
            watchdog.nudge();
        }
        Ok(())
    }

    /// Status sections as requested by the caller; also (re-)starts the
    /// project's watchdog and forwards nudges.
    pub async fn check_status(
        self: &Arc<Self>,
        project: &ProjectName,
        query: StatusQuery,
    ) -> Result<StatusReport, AiTaskError> {
        self.init_watchdog(
            project,
            query.nudge_watchdog,
            query.recheck_autotrain_settings,
        )
        .await?;

        let mut report = StatusReport::default();
        if query.project {
            let watchdogs = self.watchdogs.read().await;
            if let Some(watchdog) = watchdogs.get(project) {
                report.project = Some(ProjectStatus {
                    ai_auto_training_enabled: watchdog.autotrain_enabled(),
                    num_annotated: watchdog.last_count(),
                    num_next_training: watchdog.threshold(),
                });
            }
        }
        if query.tasks {
            report.tasks = Some(self.tracker.poll_all_task_statuses(project).await?);
        }
        if query.workers {
            report.workers = Some(self.task_monitor.snapshot().await);
        }
        Ok(report)
    }

    /// Stops and drops the project's watchdog; called from the project
    /// deletion flow.
    pub async fn project_deleted(&self, project: &ProjectName) {
        let mut watchdogs = self.watchdogs.write().await;
        if let Some(watchdog) = watchdogs.remove(project) {
            watchdog.stop();
        }
    }

    pub async fn shutdown(&self) {
        let mut watchdogs = self.watchdogs.write().await;
        for (_, watchdog) in watchdogs.drain() {
            watchdog.stop();
        }
        self.task_monitor.stop();
    }

    // ----- model states ---------------------------------------------------

    fn library_ref(descriptor: Option<&ModelDescriptor>, id: Option<String>) -> LibraryRef {
        LibraryRef {
            name: descriptor
                .map(|descriptor| descriptor.name.clone())
                .unwrap_or_else(|| "(not found)".to_string()),
            id,
        }
    }

    pub async fn list_model_states(
        &self,
        project: &ProjectName,
        latest_only: bool,
    ) -> Result<Vec<ModelStateListing>, AiTaskError> {
        let states = self.model_state_repo.list_meta(project, latest_only).await?;
        let marketplace = self.model_state_repo.marketplace_meta().await?;

        Ok(states
            .into_iter()
            .map(|state| {
                let model_library = Self::library_ref(
                    state
                        .model_library
                        .as_deref()
                        .and_then(|key| self.registry.prediction_descriptor(key)),
                    state.model_library.clone(),
                );
                let al_criterion_library = Self::library_ref(
                    state
                        .al_criterion_library
                        .as_deref()
                        .and_then(|key| self.registry.ranking_descriptor(key)),
                    state.al_criterion_library.clone(),
                );

                // a state shared to the marketplace wins over its origin
                let state_id = state.id.0;
                let marketplace_info = marketplace
                    .iter()
                    .find(|meta| meta.origin_uuid == Some(state_id))
                    .or_else(|| {
                        marketplace.iter().find(|meta| {
                            state.imported_from_marketplace
                                && state.marketplace_origin_id == Some(meta.id)
                        })
                    })
                    .cloned();

                ModelStateListing {
                    id: state.id.to_string(),
                    time_created: state.time_created.timestamp_micros() as f64 / 1e6,
                    model_library,
                    al_criterion_library,
                    num_pred: state.num_pred,
                    labelclass_autoupdate: state.labelclass_autoupdate,
                    imported_from_marketplace: state.imported_from_marketplace,
                    marketplace_info,
                }
            })
            .collect())
    }

    async fn submit_control_task(
        &self,
        name: &str,
        kwargs: Kwargs,
    ) -> Result<TaskId, AiTaskError> {
        let task_id = WorkflowId::new_v4();
        let graph = TaskGraph::single(TaskSignature::new(name, QUEUE_AI_CONTROLLER, kwargs));
        self.broker
            .submit(QUEUE_AI_CONTROLLER, task_id, &graph)
            .await?;
        Ok(TaskId(task_id.0))
    }

    /// Launches a broker task deleting the given model states; returns the
    /// task id.
    pub async fn delete_model_states(
        &self,
        project: &ProjectName,
        username: &str,
        model_state_ids: &[String],
    ) -> Result<TaskId, AiTaskError> {
        info!(project = %project, username, "Deleting {} model state(s)", model_state_ids.len());
        let kwargs = json!({
            "project": project.as_str(),
            "modelStateIDs": model_state_ids,
        });
        self.submit_control_task(
            task_names::DELETE_MODEL_STATES,
            kwargs.as_object().cloned().unwrap_or_default(),
        )
        .await
    }

    /// Launches a broker task duplicating a model state; returns the task
    /// id.
    pub async fn duplicate_model_state(
        &self,
        project: &ProjectName,
        username: &str,
        model_state_id: ModelStateId,
        skip_if_latest: bool,
    ) -> Result<TaskId, AiTaskError> {
        info!(project = %project, username, model_state = %model_state_id, "Duplicating model state");
        let kwargs = json!({
            "project": project.as_str(),
            "modelStateID": model_state_id.to_string(),
            "skipIfLatest": skip_if_latest,
        });
        self.submit_control_task(
            task_names::DUPLICATE_MODEL_STATE,
            kwargs.as_object().cloned().unwrap_or_default(),
        )
        .await
    }

    /// Launches a broker task assembling model training statistics;
    /// returns the task id.
    pub async fn get_model_training_stats(
        &self,
        project: &ProjectName,
        username: &str,
        model_state_ids: Option<&[ModelStateId]>,
    ) -> Result<TaskId, AiTaskError> {
        info!(project = %project, username, "Assembling model training statistics");
        let ids: Option<Vec<String>> = model_state_ids
            .map(|ids| ids.iter().map(ModelStateId::to_string).collect());
        let kwargs = json!({
            "project": project.as_str(),
            "modelStateIDs": ids,
        });
        self.submit_control_task(
            task_names::GET_MODEL_TRAINING_STATISTICS,
            kwargs.as_object().cloned().unwrap_or_default(),
        )
        .await
    }

    // ----- saved workflows ------------------------------------------------

    pub async fn get_saved_workflows(
        &self,
        project: &ProjectName,
    ) -> Result<BTreeMap<String, SavedWorkflowMeta>, AiTaskError> {
        let default_workflow = self.project_repo.default_workflow_id(project).await?;
        let records = self.workflow_repo.list(project).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                (
                    record.id.to_string(),
                    SavedWorkflowMeta {
                        name: record.name,
                        workflow: record.workflow,
                        author: record.username,
                        time_created: record.time_created.timestamp_micros() as f64 / 1e6,
                        time_modified: record.time_modified.timestamp_micros() as f64 / 1e6,
                        default_workflow: default_workflow == Some(record.id),
                    },
                )
            })
            .collect())
    }

    /// Verifies and stores a workflow definition; an existing workflow
    /// with the same name or id is updated instead.
    pub async fn save_workflow(
        &self,
        project: &ProjectName,
        username: &str,
        workflow: &Value,
        workflow_id: Option<WorkflowId>,
        workflow_name: &str,
        set_default: bool,
    ) -> Result<WorkflowId, AiTaskError> {
        let document =
            WorkflowDocument::from_json(workflow).map_err(AiTaskError::invalid_workflow)?;
        if !self.compiler.verify_only(project, &document).await? {
            return Err(AiTaskError::InvalidWorkflow(
                "Workflow is not valid.".to_string(),
            ));
        }

        let existing = self
            .workflow_repo
            .find_existing(project, workflow_name, workflow_id)
            .await?;
        let saved_id = match existing {
            Some(id) => {
                self.workflow_repo
                    .update(project, id, workflow_name, workflow)
                    .await?
            }
            None => {
                self.workflow_repo
                    .insert(project, workflow_name, workflow, username)
                    .await?
            }
        };

        if set_default {
            self.set_default_workflow(project, saved_id).await?;
        }
        Ok(saved_id)
    }

    pub async fn set_default_workflow(
        &self,
        project: &ProjectName,
        workflow_id: WorkflowId,
    ) -> Result<(), AiTaskError> {
        let result = self
            .project_repo
            .set_default_workflow(project, workflow_id)
            .await?;
        if result != Some(workflow_id) {
            return Err(AiTaskError::UnknownWorkflow(workflow_id.to_string()));
        }
        Ok(())
    }

    /// Deletes saved workflows owned by the user (or by superusers).
    pub async fn delete_workflow(
        &self,
        project: &ProjectName,
        username: &str,
        workflow_ids: &[WorkflowId],
    ) -> Result<Vec<WorkflowId>, AiTaskError> {
        Ok(self
            .workflow_repo
            .delete_owned(project, username, workflow_ids)
            .await?)
    }

    pub async fn delete_workflow_history(
        &self,
        project: &ProjectName,
        selector: HistorySelector,
        revoke_running: bool,
    ) -> Result<Vec<WorkflowId>, AiTaskError> {
        self.tracker
            .delete_history(project, selector, revoke_running)
            .await
    }

    // ----- AI model info and settings --------------------------------------

    /// Whether model training is possible: the configured library plus the
    /// connected AIController/AIWorker consumers.
    pub async fn get_ai_model_training_info(
        &self,
        project: &ProjectName,
    ) -> Result<TrainingInfo, AiTaskError> {
        let ai_model_library = self
            .project_repo
            .get_workflow_defaults(project)
            .await?
            .and_then(|defaults| defaults.ai_model_library);

        let snapshot = self.broker.inspect().await?;
        let workers_for = |queue: &str| -> Vec<String> {
            snapshot
                .workers
                .iter()
                .filter(|worker| worker.queues.contains(queue))
                .map(|worker| worker.id.clone())
                .collect()
        };
        Ok(TrainingInfo {
            ai_model_library,
            workers: TrainingInfoWorkers {
                ai_controller: workers_for(QUEUE_AI_CONTROLLER),
                ai_worker: workers_for(QUEUE_AI_WORKER),
            },
        })
    }

    /// All registered models, or only those compatible with the project's
    /// annotation and prediction types.
    pub async fn get_available_ai_models(
        &self,
        project: Option<&ProjectName>,
    ) -> Result<AvailableModels, AiTaskError> {
        let ranking: BTreeMap<String, ModelDescriptor> = self
            .registry
            .ranking_descriptors()
            .map(|descriptor| (descriptor.key.clone(), descriptor.clone()))
            .collect();

        let prediction: BTreeMap<String, ModelDescriptor> = match project {
            None => self
                .registry
                .prediction_descriptors()
                .map(|descriptor| (descriptor.key.clone(), descriptor.clone()))
                .collect(),
            Some(project) => {
                let record = self
                    .project_repo
                    .get(project)
                    .await?
                    .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
                self.registry
                    .prediction_descriptors_for(record.annotation_type, record.prediction_type)
                    .map(|descriptor| (descriptor.key.clone(), descriptor.clone()))
                    .collect()
            }
        };

        Ok(AvailableModels {
            prediction,
            ranking,
        })
    }

    /// Verifies model options through the model's own check, falling back
    /// to instantiating the model when it exposes no verifier.
    pub async fn verify_ai_model_options(
        &self,
        project: &ProjectName,
        model_options: &Value,
        model_library: Option<&str>,
    ) -> Result<OptionsVerdict, AiTaskError> {
        let library = match model_library
            .filter(|library| self.registry.prediction_descriptor(library).is_some())
        {
            Some(library) => Some(library.to_string()),
            None => self
                .project_repo
                .get_workflow_defaults(project)
                .await?
                .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?
                .ai_model_library,
        };
        let Some(library) = library else {
            return Ok(OptionsVerdict::invalid(vec![
                "No AI model library configured for this project.".to_string(),
            ]));
        };
        let Some(adapter) = self.registry.prediction_adapter(&library) else {
            return Ok(OptionsVerdict::invalid(vec![format!(
                "Model library \"{library}\" is not installed in this instance."
            )]));
        };

        if let Some(verdict) = adapter.verify_options(model_options) {
            return Ok(verdict);
        }
        let model_name = self
            .registry
            .prediction_descriptor(&library)
            .map(|descriptor| descriptor.name.clone())
            .unwrap_or(library);
        match adapter.instantiate(project, model_options) {
            Ok(()) => Ok(OptionsVerdict {
                valid: true,
                warnings: vec![format!(
                    "A {model_name} instance could be launched, \
                     but the settings could not be verified."
                )],
                errors: Vec::new(),
            }),
            Err(error) => Ok(OptionsVerdict::invalid(vec![error])),
        }
    }

    /// Verifies and stores the project's model settings; invalid settings
    /// are reported, not saved.
    pub async fn save_project_model_settings(
        &self,
        project: &ProjectName,
        settings: &Value,
    ) -> Result<OptionsVerdict, AiTaskError> {
        let mut verdict = self
            .verify_ai_model_options(project, settings, None)
            .await?;
        if verdict.valid {
            self.project_repo
                .set_model_settings(project, Some(settings))
                .await?;
        } else {
            verdict.errors.push(
                "Model options have not passed verification and were therefore not saved."
                    .to_string(),
            );
        }
        Ok(verdict)
    }

    async fn add_background_label_class(
        &self,
        project: &ProjectName,
    ) -> Result<(), AiTaskError> {
        let classes = self.labeling_repo.label_classes(project).await?;
        if classes.iter().any(|class| class.idx == 0) {
            return Ok(());
        }
        let names: Vec<&str> = classes.iter().map(|class| class.name.as_str()).collect();
        let mut name = "background".to_string();
        let mut counter = 0;
        while names.contains(&name.as_str()) {
            name = format!("background ({counter})");
            counter += 1;
        }
        self.labeling_repo
            .insert_label_class(
                project,
                &crate::model::LabelClassRow {
                    name,
                    idx: 0,
                    hidden: true,
                },
            )
            .await?;
        Ok(())
    }

    /// Applies AI model settings to the project record. A blank model or
    /// criterion library disables the model; disabling
    /// `segmentation_ignore_unlabeled` on a segmentation project adds a
    /// hidden "background" class at index 0.
    pub async fn update_ai_model_settings(
        &self,
        project: &ProjectName,
        settings: &Kwargs,
    ) -> Result<SettingsUpdateOutcome, AiTaskError> {
        let record = self
            .project_repo
            .get(project)
            .await?
            .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;

        let mut updates: Vec<SettingUpdate> = Vec::new();
        let mut enabled_index: Option<usize> = None;
        let mut force_disable = false;
        let mut add_background_class = false;

        for (key, value) in settings {
            match key.as_str() {
                "ai_model_enabled" => {
                    enabled_index = Some(updates.len());
                    updates.push(SettingUpdate {
                        column: "ai_model_enabled",
                        value: SettingValue::Bool(as_bool(key, value)?),
                    });
                }
                "ai_model_library" => {
                    let library = as_opt_string(value);
                    match &library {
                        None => force_disable = true,
                        Some(library) => {
                            let descriptor = self
                                .registry
                                .prediction_descriptor(library)
                                .ok_or_else(|| {
                                    AiTaskError::internal(format!(
                                        "Model library \"{library}\" is not installed \
                                         in this instance."
                                    ))
                                })?;
                            if !descriptor.annotation_types.contains(&record.annotation_type) {
                                return Err(AiTaskError::internal(format!(
                                    "Model \"{library}\" does not support annotations \
                                     of type \"{}\".",
                                    record.annotation_type
                                )));
                            }
                            if !descriptor.prediction_types.contains(&record.prediction_type) {
                                return Err(AiTaskError::internal(format!(
                                    "Model \"{library}\" does not support predictions \
                                     of type \"{}\".",
                                    record.prediction_type
                                )));
                            }
                        }
                    }
                    updates.push(SettingUpdate {
                        column: "ai_model_library",
                        value: SettingValue::Text(library),
                    });
                }
                "ai_alcriterion_library" => {
                    let library = as_opt_string(value);
                    match &library {
                        None => force_disable = true,
                        Some(library) => {
                            if self.registry.ranking_descriptor(library).is_none() {
                                return Err(AiTaskError::internal(format!(
                                    "Ranking library \"{library}\" is not installed \
                                     in this instance."
                                )));
                            }
                        }
                    }
                    updates.push(SettingUpdate {
                        column: "ai_alcriterion_library",
                        value: SettingValue::Text(library),
                    });
                }
                "numimages_autotrain" => updates.push(SettingUpdate {
                    column: "numImages_autoTrain",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(-1)),
                }),
                "minnumannoperimage" => updates.push(SettingUpdate {
                    column: "minNumAnnoPerImage",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(0)),
                }),
                "maxnumimages_train" => updates.push(SettingUpdate {
                    column: "maxNumImages_train",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(0)),
                }),
                "maxnumimages_inference" => updates.push(SettingUpdate {
                    column: "maxNumImages_inference",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(0)),
                }),
                "inference_chunk_size" => updates.push(SettingUpdate {
                    column: "inference_chunk_size",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(0)),
                }),
                "max_num_concurrent_tasks" => updates.push(SettingUpdate {
                    column: "max_num_concurrent_tasks",
                    value: SettingValue::Int(as_int(key, value)?.unwrap_or(0)),
                }),
                "segmentation_ignore_unlabeled" => {
                    let flag = as_bool(key, value)?;
                    if !flag
                        && record.annotation_type
                            == annolab_common::model::AnnotationType::SegmentationMasks
                    {
                        add_background_class = true;
                    }
                    updates.push(SettingUpdate {
                        column: "segmentation_ignore_unlabeled",
                        value: SettingValue::Bool(flag),
                    });
                }
                // model settings are verified and saved separately below
                "ai_model_settings" | "ai_alcriterion_settings" => {}
                _ => {}
            }
        }

        if force_disable {
            match enabled_index {
                Some(index) => updates[index].value = SettingValue::Bool(false),
                None => updates.push(SettingUpdate {
                    column: "ai_model_enabled",
                    value: SettingValue::Bool(false),
                }),
            }
        }

        self.project_repo
            .update_ai_settings(project, &updates)
            .await?;

        if add_background_class {
            self.add_background_label_class(project).await?;
        }

        let mut outcome = SettingsUpdateOutcome::default();
        if let Some(model_settings) = settings.get("ai_model_settings") {
            outcome.ai_model_settings_status = Some(
                self.save_project_model_settings(project, model_settings)
                    .await?,
            );
        }
        Ok(outcome)
    }

    // ----- label class auto-adaptation -------------------------------------

    /// Whether the project, its current model state and its model library
    /// support automatic label-class adaptation.
    pub async fn get_labelclass_autoadapt_info(
        &self,
        project: &ProjectName,
        model_id: Option<ModelStateId>,
    ) -> Result<LabelclassAutoadaptInfo, AiTaskError> {
        let model = self
            .model_state_repo
            .labelclass_autoupdate(project, model_id)
            .await?
            .unwrap_or(false);
        let record = self
            .project_repo
            .get(project)
            .await?
            .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
        let model_lib = record
            .ai_model_library
            .as_deref()
            .and_then(|library| self.registry.prediction_descriptor(library))
            .map(|descriptor| descriptor.can_add_labelclasses)
            .unwrap_or(false);
        Ok(LabelclassAutoadaptInfo {
            model,
            model_lib,
            project: record.labelclass_autoupdate,
        })
    }

    /// Enables or disables label-class auto-adaptation. Disabling is
    /// refused while the current model state itself has it enabled.
    pub async fn set_labelclass_autoadapt_enabled(
        &self,
        project: &ProjectName,
        enabled: bool,
    ) -> Result<bool, AiTaskError> {
        if !enabled {
            let info = self.get_labelclass_autoadapt_info(project, None).await?;
            if info.model {
                return Ok(false);
            }
        }
        Ok(self
            .project_repo
            .set_labelclass_autoupdate(project, enabled)
            .await?)
    }
}
