use std::collections::HashMap;
use std::sync::Arc;

use annolab_common::model::ProjectName;
use serde_json::{json, Value};
use tracing::warn;

use crate::broker::BrokerClient;
use crate::error::AiTaskError;
use crate::model::{ExpandedTaskSpec, Kwargs, TaskKind, TaskSpec, WorkflowDocument};
use crate::registry::{ModelAdapter, ModelRegistry};
use crate::repo::project::ProjectRepo;
use crate::workflow::defaults::default_workflow_args;
use crate::workflow::graph::{
    task_names, TaskGraph, TaskSignature, QUEUE_AI_CONTROLLER, QUEUE_AI_WORKER,
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Repeater \"{repeater}\" references unknown node \"{node}\"")]
    UnknownRepeaterTarget { repeater: String, node: String },
    #[error("Repeater \"{repeater}\" has a negative number of repetitions")]
    NegativeRepetitions { repeater: String },
    #[error("Invalid value for \"{key}\" at task index {index}: {message}")]
    InvalidKwargs {
        index: usize,
        key: String,
        message: String,
    },
}

/// Project-level kwarg defaults, loaded from the central project record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectDefaults {
    pub min_anno_per_image: Option<i64>,
    pub max_num_images_train: Option<i64>,
    pub max_num_images_inference: Option<i64>,
    pub ai_model_library: Option<String>,
}

impl ProjectDefaults {
    fn for_kind(&self, kind: TaskKind) -> Kwargs {
        let mut map = Kwargs::new();
        match kind {
            TaskKind::Train => {
                if let Some(min_anno) = self.min_anno_per_image {
                    map.insert("min_anno_per_image".to_string(), json!(min_anno));
                }
                if let Some(max_images) = self.max_num_images_train {
                    map.insert("max_num_images".to_string(), json!(max_images));
                }
            }
            TaskKind::Inference => {
                if let Some(max_images) = self.max_num_images_inference {
                    map.insert("max_num_images".to_string(), json!(max_images));
                }
            }
            TaskKind::Repeater | TaskKind::Connector => {}
        }
        map
    }
}

pub struct CompiledWorkflow {
    pub graph: TaskGraph,
    pub specs: Vec<ExpandedTaskSpec>,
}

/// Integer coercion for kwargs that may arrive as numbers, numeric strings
/// or blanks (treated as absent).
fn opt_int(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("\"{s}\" is not an integer")),
        other => Err(format!("{other} is not an integer")),
    }
}

/// Duplicates the repeated subranges in place. For each repeater, the
/// contiguous subrange `[end_node, start_node]` of the original task list is
/// repeated `num_repetitions` times and spliced in right after the start
/// node. Repeaters are applied in the forward order of their start nodes.
fn expand_repeaters(document: &WorkflowDocument) -> Result<Vec<TaskSpec>, CompileError> {
    if document.repeaters.is_empty() {
        return Ok(document.tasks.clone());
    }

    let mut node_index: HashMap<&str, usize> = HashMap::new();
    for (idx, spec) in document.tasks.iter().enumerate() {
        if let Some(id) = spec.id() {
            node_index.insert(id, idx);
        }
    }

    let mut spans: Vec<(usize, usize, i64)> = Vec::new();
    for (key, repeater) in &document.repeaters {
        let start = *node_index.get(repeater.start_node.as_str()).ok_or_else(|| {
            CompileError::UnknownRepeaterTarget {
                repeater: key.clone(),
                node: repeater.start_node.clone(),
            }
        })?;
        let end = *node_index.get(repeater.end_node.as_str()).ok_or_else(|| {
            CompileError::UnknownRepeaterTarget {
                repeater: key.clone(),
                node: repeater.end_node.clone(),
            }
        })?;
        if repeater.kwargs.num_repetitions < 0 {
            return Err(CompileError::NegativeRepetitions {
                repeater: key.clone(),
            });
        }
        spans.push((start, end, repeater.kwargs.num_repetitions));
    }
    spans.sort_by_key(|(start, _, _)| *start);

    let mut expanded = document.tasks.clone();
    let mut offset = 0usize;
    for (start, end, repetitions) in spans {
        if end > start {
            continue;
        }
        let sub = &document.tasks[end..=start];
        let mut block = Vec::with_capacity(sub.len() * repetitions as usize);
        for _ in 0..repetitions {
            block.extend_from_slice(sub);
        }
        let insert_at = start + offset + 1;
        offset += block.len();
        expanded.splice(insert_at..insert_at, block);
    }
    Ok(expanded)
}

/// Expands a workflow document into the flat list of fully-populated task
/// specs: repeater expansion, kwarg auto-completion (existing value >
/// document options > project default > built-in default), worker clamping
/// and epoch assignment.
pub fn expand_workflow(
    document: &WorkflowDocument,
    project_defaults: &ProjectDefaults,
    available_workers: usize,
) -> Result<Vec<ExpandedTaskSpec>, CompileError> {
    let expanded = expand_repeaters(document)?;

    let mut epoch: u64 = 0;
    let mut specs = Vec::new();

    for (index, spec) in expanded.iter().enumerate() {
        let kind = spec.kind();
        if kind.is_noop() {
            continue;
        }
        let defaults = default_workflow_args(kind).unwrap_or_default();
        let kind_defaults = project_defaults.for_kind(kind);

        let mut kwargs = match spec {
            TaskSpec::Name(_) => Kwargs::new(),
            TaskSpec::Node(node) => node.kwargs.clone(),
        };
        for (key, default_value) in &defaults {
            if kwargs.contains_key(key) {
                continue;
            }
            let value = document
                .options
                .get(key)
                .or_else(|| kind_defaults.get(key))
                .unwrap_or(default_value);
            kwargs.insert(key.clone(), value.clone());
        }

        let requested = match kwargs.get("max_num_workers") {
            Some(value) => opt_int(value)
                .map_err(|message| CompileError::InvalidKwargs {
                    index,
                    key: "max_num_workers".to_string(),
                    message,
                })?
                .unwrap_or(-1),
            None => -1,
        };
        let effective = if requested < 0 {
            available_workers as i64
        } else {
            requested.min(available_workers as i64)
        }
        .max(1);
        kwargs.insert("max_num_workers".to_string(), json!(effective));

        if kind == TaskKind::Train {
            epoch += 1;
        }
        kwargs.insert("epoch".to_string(), json!(epoch.max(1)));

        specs.push(ExpandedTaskSpec { kind, kwargs });
    }

    let num_epochs = epoch.max(1);
    for spec in &mut specs {
        spec.kwargs
            .insert("numEpochs".to_string(), json!(num_epochs));
    }

    Ok(specs)
}

/// Calls the model's option check and treats everything but an explicit
/// negative verdict as valid, so a broken verifier never blocks a workflow.
fn model_settings_valid(adapter: Option<&dyn ModelAdapter>, options: &Value) -> bool {
    match adapter {
        Some(adapter) => match adapter.verify_options(options) {
            Some(verdict) => verdict.valid,
            None => true,
        },
        None => true,
    }
}

fn verified_settings(
    kwargs: &Kwargs,
    key: &str,
    adapter: Option<&dyn ModelAdapter>,
) -> Value {
    match kwargs.get(key) {
        Some(settings) if !settings.is_null() => {
            if model_settings_valid(adapter, settings) {
                settings.clone()
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}

fn int_kwarg(
    kwargs: &Kwargs,
    key: &str,
    index: usize,
) -> Result<Option<i64>, CompileError> {
    match kwargs.get(key) {
        Some(value) => opt_int(value).map_err(|message| CompileError::InvalidKwargs {
            index,
            key: key.to_string(),
            message,
        }),
        None => Ok(None),
    }
}

fn training_subgraph(
    project: &ProjectName,
    spec: &ExpandedTaskSpec,
    index: usize,
    is_first_task: bool,
    adapter: Option<&dyn ModelAdapter>,
) -> Result<TaskGraph, CompileError> {
    let kwargs = &spec.kwargs;
    let epoch = kwargs.get("epoch").cloned().unwrap_or(Value::Null);
    let num_epochs = kwargs.get("numEpochs").cloned().unwrap_or(Value::Null);
    let num_workers = spec.max_num_workers().unwrap_or(1).max(1);
    let ai_model_settings = verified_settings(kwargs, "ai_model_settings", adapter);

    let mut items = Vec::new();
    let mut train_args = Kwargs::new();
    train_args.insert("epoch".to_string(), epoch.clone());
    train_args.insert("numEpochs".to_string(), num_epochs.clone());
    train_args.insert("project".to_string(), json!(project.as_str()));
    train_args.insert("aiModelSettings".to_string(), ai_model_settings.clone());

    match kwargs.get("data") {
        Some(data) => {
            train_args.insert("data".to_string(), data.clone());
        }
        None => {
            let min_anno = int_kwarg(kwargs, "min_anno_per_image", index)?;
            let max_images = int_kwarg(kwargs, "max_num_images", index)?;
            let mut image_args = Kwargs::new();
            image_args.insert("project".to_string(), json!(project.as_str()));
            image_args.insert("epoch".to_string(), epoch.clone());
            image_args.insert("numEpochs".to_string(), num_epochs.clone());
            image_args.insert(
                "minTimestamp".to_string(),
                kwargs.get("min_timestamp").cloned().unwrap_or(Value::Null),
            );
            image_args.insert(
                "includeGoldenQuestions".to_string(),
                kwargs
                    .get("include_golden_questions")
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            image_args.insert("minNumAnnoPerImage".to_string(), json!(min_anno));
            image_args.insert("maxNumImages".to_string(), json!(max_images));
            image_args.insert("numWorkers".to_string(), json!(num_workers));

            let acquisition = TaskSignature::new(
                task_names::GET_TRAINING_IMAGES,
                QUEUE_AI_CONTROLLER,
                image_args,
            );
            if is_first_task {
                let mut update_args = Kwargs::new();
                update_args.insert("project".to_string(), json!(project.as_str()));
                update_args.insert("numEpochs".to_string(), num_epochs.clone());
                update_args.insert("blank".to_string(), Value::Null);
                items.push(TaskGraph::Group(vec![
                    TaskGraph::single(acquisition),
                    TaskGraph::single(TaskSignature::new(
                        task_names::CALL_UPDATE_MODEL,
                        QUEUE_AI_WORKER,
                        update_args,
                    )),
                ]));
            } else {
                items.push(TaskGraph::single(acquisition));
            }
        }
    }

    if num_workers > 1 {
        let mut train_tasks = Vec::new();
        for worker_index in 0..num_workers {
            let mut worker_args = train_args.clone();
            worker_args.insert("index".to_string(), json!(worker_index));
            train_tasks.push(TaskGraph::single(TaskSignature::new(
                task_names::CALL_TRAIN,
                QUEUE_AI_WORKER,
                worker_args,
            )));
        }
        let mut body_args = Kwargs::new();
        body_args.insert("epoch".to_string(), epoch);
        body_args.insert("numEpochs".to_string(), num_epochs);
        body_args.insert("project".to_string(), json!(project.as_str()));
        body_args.insert("aiModelSettings".to_string(), ai_model_settings);
        items.push(TaskGraph::Chord {
            header: train_tasks,
            body: TaskSignature::new(
                task_names::CALL_AVERAGE_MODEL_STATES,
                QUEUE_AI_WORKER,
                body_args,
            ),
        });
    } else {
        train_args.insert("index".to_string(), json!(0));
        items.push(TaskGraph::single(TaskSignature::new(
            task_names::CALL_TRAIN,
            QUEUE_AI_WORKER,
            train_args,
        )));
    }

    Ok(TaskGraph::chain(items))
}

fn inference_subgraph(
    project: &ProjectName,
    spec: &ExpandedTaskSpec,
    index: usize,
    is_first_task: bool,
    adapter: Option<&dyn ModelAdapter>,
) -> Result<TaskGraph, CompileError> {
    let kwargs = &spec.kwargs;
    let epoch = kwargs.get("epoch").cloned().unwrap_or(Value::Null);
    let num_epochs = kwargs.get("numEpochs").cloned().unwrap_or(Value::Null);
    let num_workers = spec.max_num_workers().unwrap_or(1).max(1);
    let ai_model_settings = verified_settings(kwargs, "ai_model_settings", adapter);
    let al_criterion_settings = kwargs
        .get("alcriterion_settings")
        .cloned()
        .unwrap_or(Value::Null);

    let mut items = Vec::new();
    let mut inference_args = Kwargs::new();
    inference_args.insert("epoch".to_string(), epoch.clone());
    inference_args.insert("numEpochs".to_string(), num_epochs.clone());
    inference_args.insert("project".to_string(), json!(project.as_str()));
    inference_args.insert("aiModelSettings".to_string(), ai_model_settings);
    inference_args.insert("alCriterionSettings".to_string(), al_criterion_settings);

    match kwargs.get("data") {
        Some(data) => {
            inference_args.insert("data".to_string(), data.clone());
        }
        None => {
            let max_images = int_kwarg(kwargs, "max_num_images", index)?;
            let mut image_args = Kwargs::new();
            image_args.insert("project".to_string(), json!(project.as_str()));
            image_args.insert("epoch".to_string(), epoch.clone());
            image_args.insert("numEpochs".to_string(), num_epochs.clone());
            image_args.insert(
                "goldenQuestionsOnly".to_string(),
                kwargs
                    .get("golden_questions_only")
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            image_args.insert(
                "forceUnlabeled".to_string(),
                kwargs.get("force_unlabeled").cloned().unwrap_or(Value::Null),
            );
            image_args.insert("maxNumImages".to_string(), json!(max_images));
            image_args.insert("numWorkers".to_string(), json!(num_workers));

            let acquisition = TaskSignature::new(
                task_names::GET_INFERENCE_IMAGES,
                QUEUE_AI_CONTROLLER,
                image_args,
            );
            if is_first_task {
                let mut update_args = Kwargs::new();
                update_args.insert("project".to_string(), json!(project.as_str()));
                update_args.insert("numEpochs".to_string(), num_epochs.clone());
                update_args.insert("blank".to_string(), Value::Null);
                items.push(TaskGraph::Group(vec![
                    TaskGraph::single(acquisition),
                    TaskGraph::single(TaskSignature::new(
                        task_names::CALL_UPDATE_MODEL,
                        QUEUE_AI_WORKER,
                        update_args,
                    )),
                ]));
            } else {
                items.push(TaskGraph::single(acquisition));
            }
        }
    }

    if num_workers > 1 {
        let mut inference_tasks = Vec::new();
        for worker_index in 0..num_workers {
            let mut worker_args = inference_args.clone();
            worker_args.insert("index".to_string(), json!(worker_index));
            inference_tasks.push(TaskGraph::single(TaskSignature::new(
                task_names::CALL_INFERENCE,
                QUEUE_AI_WORKER,
                worker_args,
            )));
        }
        items.push(TaskGraph::Group(inference_tasks));
    } else {
        inference_args.insert("index".to_string(), json!(0));
        items.push(TaskGraph::single(TaskSignature::new(
            task_names::CALL_INFERENCE,
            QUEUE_AI_WORKER,
            inference_args,
        )));
    }

    Ok(TaskGraph::chain(items))
}

/// Builds the submittable graph for an expanded spec list. The first task
/// of the workflow loads a fresh model state in parallel with its image
/// listing; subsequent tasks reuse the state produced upstream.
pub fn build_task_graph(
    project: &ProjectName,
    specs: &[ExpandedTaskSpec],
    adapter: Option<&dyn ModelAdapter>,
) -> Result<TaskGraph, CompileError> {
    let mut items = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let subgraph = match spec.kind {
            TaskKind::Train => training_subgraph(project, spec, index, index == 0, adapter)?,
            TaskKind::Inference => inference_subgraph(project, spec, index, index == 0, adapter)?,
            TaskKind::Repeater | TaskKind::Connector => continue,
        };
        items.push(subgraph);
    }
    Ok(TaskGraph::chain(items))
}

/// Compiles declarative workflow documents into broker-submittable task
/// graphs, resolving project defaults from the store and the worker count
/// from the broker's live inspection.
pub struct WorkflowCompiler {
    project_repo: Arc<dyn ProjectRepo>,
    broker: Arc<dyn BrokerClient>,
    registry: Arc<ModelRegistry>,
}

impl WorkflowCompiler {
    pub fn new(
        project_repo: Arc<dyn ProjectRepo>,
        broker: Arc<dyn BrokerClient>,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        WorkflowCompiler {
            project_repo,
            broker,
            registry,
        }
    }

    async fn available_workers(&self) -> usize {
        match self.broker.inspect().await {
            Ok(snapshot) => snapshot.count_queue_consumers(QUEUE_AI_WORKER),
            Err(error) => {
                warn!("Could not resolve available workers, assuming one: {error}");
                1
            }
        }
    }

    pub async fn compile(
        &self,
        project: &ProjectName,
        document: &WorkflowDocument,
    ) -> Result<CompiledWorkflow, AiTaskError> {
        let defaults = self
            .project_repo
            .get_workflow_defaults(project)
            .await?
            .ok_or_else(|| AiTaskError::UnknownProject(project.clone()))?;
        let available_workers = self.available_workers().await;

        let specs = expand_workflow(document, &defaults, available_workers)
            .map_err(AiTaskError::invalid_workflow)?;
        let adapter = defaults
            .ai_model_library
            .as_deref()
            .and_then(|library| self.registry.prediction_adapter(library));
        let graph = build_task_graph(project, &specs, adapter.as_deref())
            .map_err(AiTaskError::invalid_workflow)?;

        Ok(CompiledWorkflow { graph, specs })
    }

    /// Compile in verification mode: true iff the document expands and
    /// every subgraph builds. Store and broker failures still propagate.
    pub async fn verify_only(
        &self,
        project: &ProjectName,
        document: &WorkflowDocument,
    ) -> Result<bool, AiTaskError> {
        match self.compile(project, document).await {
            Ok(_) => Ok(true),
            Err(AiTaskError::InvalidWorkflow(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }
}
