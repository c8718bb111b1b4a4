use annolab_common::model::TaskId;
use annolab_ai_service::error::AiTaskError;
use annolab_ai_service::model::{
    tree_task_ids, HistorySelector, TaskNode, WorkflowDocument,
};
use annolab_ai_service::broker::TaskStatus;
use annolab_ai_service::registry::{
    ModelAdapter, ModelMetadata, ModelRegistry, OptionsVerdict,
};
use annolab_ai_service::repo::model_state::ModelStateRepo;
use annolab_ai_service::service::control_tasks::ControlTasks;
use annolab_ai_service::service::controller::WorkflowRef;
use annolab_ai_service::workflow::graph::task_names;
use annolab_common::model::{AnnotationType, ProjectName, WorkflowId};
use serde_json::{json, Value};
use std::sync::Arc;
use test_r::test;

mod support;

use support::{project_name, test_project, TestEnv};

test_r::enable!();

fn document(value: Value) -> WorkflowDocument {
    serde_json::from_value(value).unwrap()
}

fn train_inference_doc() -> WorkflowDocument {
    document(json!({
        "tasks": ["train", "inference"],
        "options": {"max_num_workers": 1}
    }))
}

// ---------------------------------------------------------------------------
// compile-and-dispatch

#[test]
async fn dispatch_writes_history_row_and_task_tree() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let workflow_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();

    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.launched_by.as_deref(), Some("alice"));
    assert!(row.time_finished.is_none());
    assert!(row.succeeded.is_none());

    let tree = row.tasks.unwrap();
    let names: Vec<&str> = tree.iter().map(|node| node.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            task_names::GROUP,
            task_names::CALL_TRAIN,
            task_names::GET_INFERENCE_IMAGES,
            task_names::CALL_INFERENCE,
        ]
    );
    // first step runs image listing and model update in parallel
    let prelude: Vec<&str> = tree[0]
        .children
        .iter()
        .map(|node| node.name.as_str())
        .collect();
    assert_eq!(
        prelude,
        vec![task_names::GET_TRAINING_IMAGES, task_names::CALL_UPDATE_MODEL]
    );
    // the terminal task carries the workflow id
    assert_eq!(tree.last().unwrap().id.0, workflow_id.0);
}

#[test]
async fn failed_submission_leaves_no_history_row() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    env.broker.set_unavailable(true);
    let result = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await;

    assert!(matches!(result, Err(AiTaskError::Broker(_))));
    env.broker.set_unavailable(false);
    assert_eq!(env.history_repo.row_count(), 0);
}

#[test]
async fn launch_by_saved_id_and_default() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let saved_id = env
        .controller
        .save_workflow(
            &project,
            "alice",
            &train_inference_doc().to_json(),
            None,
            "nightly training",
            true,
        )
        .await
        .unwrap();

    let by_id = env
        .controller
        .launch_task(&project, WorkflowRef::Id(saved_id), Some("alice"))
        .await
        .unwrap();
    env.controller
        .revoke_task(&project, by_id, "alice")
        .await
        .unwrap();

    let by_default = env
        .controller
        .launch_task(&project, WorkflowRef::Default, Some("bob"))
        .await
        .unwrap();
    assert_ne!(by_id, by_default);
}

#[test]
async fn unknown_workflow_id_is_rejected() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let result = env
        .controller
        .launch_task(&project, WorkflowRef::Id(WorkflowId::new_v4()), Some("alice"))
        .await;
    assert!(matches!(result, Err(AiTaskError::UnknownWorkflow(_))));

    let result = env
        .controller
        .launch_task(&project, WorkflowRef::Default, Some("alice"))
        .await;
    assert!(matches!(result, Err(AiTaskError::UnknownWorkflow(_))));
}

#[test]
async fn invalid_workflows_are_rejected_on_save() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let broken = json!({
        "tasks": [{"id": "a", "type": "train"}],
        "repeaters": {
            "r0": {"start_node": "a", "end_node": "missing",
                   "kwargs": {"num_repetitions": 1}}
        }
    });
    let result = env
        .controller
        .save_workflow(&project, "alice", &broken, None, "broken", false)
        .await;
    assert!(matches!(result, Err(AiTaskError::InvalidWorkflow(_))));
    assert!(env.workflow_repo.workflows.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// admission

#[test]
async fn admission_refuses_beyond_concurrency_cap() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    for user in ["alice", "bob"] {
        env.controller
            .launch_task(
                &project,
                WorkflowRef::Document(train_inference_doc()),
                Some(user),
            )
            .await
            .unwrap();
    }

    let third = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("carol"),
        )
        .await;
    assert!(matches!(third, Err(AiTaskError::AdmissionRefused(_))));
    assert_eq!(env.history_repo.row_count(), 2);
}

#[test]
async fn auto_launch_is_refused_while_any_task_runs() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    env.controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();

    assert!(!env.controller.can_launch_task(&project, true).await.unwrap());
    // one peer task does not block user launches below the cap
    assert!(env.controller.can_launch_task(&project, false).await.unwrap());

    let auto = env
        .controller
        .launch_task(&project, WorkflowRef::Document(train_inference_doc()), None)
        .await;
    assert!(matches!(auto, Err(AiTaskError::AdmissionRefused(_))));
}

#[test]
async fn zero_cap_means_unlimited_user_launches() {
    let mut project_record = test_project();
    project_record.max_num_concurrent_tasks = 0;
    let env = TestEnv::with_project(project_record).with_workers();
    let project = project_name();

    for user in ["alice", "bob", "carol"] {
        env.controller
            .launch_task(
                &project,
                WorkflowRef::Document(train_inference_doc()),
                Some(user),
            )
            .await
            .unwrap();
    }
    assert_eq!(env.history_repo.row_count(), 3);
}

// ---------------------------------------------------------------------------
// status polling and terminal transitions

#[test]
async fn completed_workflows_finalise_once() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let workflow_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();
    let tree = env.history_repo.row(workflow_id).unwrap().tasks.unwrap();

    env.broker.complete_all();
    let tracker = env.controller.tracker();
    let nodes = tracker.poll_task_status(&project, workflow_id).await.unwrap();
    assert!(!nodes.is_empty());

    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.succeeded, Some(true));
    assert!(row.time_finished.is_some());
    let finished_at = row.time_finished;

    let terminal = TaskId(workflow_id.0);
    assert_eq!(env.broker.forget_count(&terminal), 1);
    for task_id in tree_task_ids(&tree) {
        assert_eq!(env.broker.forget_count(&task_id), 1);
    }

    // repeated polls answer from the store and forget nothing further
    let nodes = tracker.poll_task_status(&project, workflow_id).await.unwrap();
    assert!(nodes
        .iter()
        .all(|node| node.status == Some(TaskStatus::Success)));
    assert_eq!(env.broker.forget_count(&terminal), 1);
    assert_eq!(env.history_repo.row(workflow_id).unwrap().time_finished, finished_at);
}

#[test]
async fn failed_tasks_collect_error_messages() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let workflow_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();
    let tree = env.history_repo.row(workflow_id).unwrap().tasks.unwrap();

    // fail the training task, complete the rest
    let train_id = tree[1].id;
    env.broker.fail_task(&train_id, "CUDA out of memory");
    env.broker.complete_all();

    env.controller
        .tracker()
        .poll_task_status(&project, workflow_id)
        .await
        .unwrap();

    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.succeeded, Some(false));
    let messages = row.messages.unwrap();
    assert!(messages.to_string().contains("CUDA out of memory"));
}

#[test]
async fn revoked_workflows_terminate_every_task() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let workflow_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();
    let tree = env.history_repo.row(workflow_id).unwrap().tasks.unwrap();

    env.controller
        .revoke_task(&project, workflow_id, "alice")
        .await
        .unwrap();

    let revoked = env.broker.revoked_tasks();
    for task_id in tree_task_ids(&tree) {
        assert!(revoked.contains(&task_id), "task {task_id} was not revoked");
    }

    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.aborted_by.as_deref(), Some("alice"));
    assert_eq!(row.succeeded, Some(false));
    assert!(row.time_finished.is_some());

    // repeated revocation is safe and does not overwrite the finisher
    let finished_at = row.time_finished;
    env.controller
        .revoke_task(&project, workflow_id, "bob")
        .await
        .unwrap();
    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.aborted_by.as_deref(), Some("alice"));
    assert_eq!(row.time_finished, finished_at);

    // subsequent polls answer from the stored state
    let nodes = env
        .controller
        .tracker()
        .poll_task_status(&project, workflow_id)
        .await
        .unwrap();
    assert!(nodes
        .iter()
        .all(|node| node.status == Some(TaskStatus::Revoked)));
}

// ---------------------------------------------------------------------------
// reconciliation

fn seeded_tree(workflow_id: WorkflowId) -> Vec<TaskNode> {
    vec![TaskNode {
        id: TaskId(workflow_id.0),
        name: task_names::CALL_TRAIN.to_string(),
        children: vec![],
    }]
}

#[test]
async fn orphaned_rows_flip_to_failed_and_back() {
    let env = TestEnv::new().with_workers();
    let project = project_name();
    let tracker = env.controller.tracker();

    let workflow_id = WorkflowId::new_v4();
    env.history_repo
        .seed_running(workflow_id, Some(seeded_tree(workflow_id)), None);

    // broker knows nothing about the task: the row is orphaned
    tracker.reconcile(&project).await.unwrap();
    let row = env.history_repo.row(workflow_id).unwrap();
    assert_eq!(row.succeeded, Some(false));
    assert!(row.time_finished.is_some());
    assert_eq!(
        row.messages,
        Some(Value::String("Auto-launched task did not finish".to_string()))
    );

    // the broker reports the task alive again: the row is resurrected
    env.broker.add_external_task(
        "worker-0",
        &workflow_id.to_string(),
        task_names::CALL_TRAIN,
        Some(project.as_str()),
    );
    tracker.reconcile(&project).await.unwrap();
    let row = env.history_repo.row(workflow_id).unwrap();
    assert!(row.time_finished.is_none());
    assert!(row.succeeded.is_none());
    assert!(row.messages.is_none());
}

#[test]
async fn live_tasks_win_over_orphan_candidates() {
    let env = TestEnv::new().with_workers();
    let project = project_name();
    let tracker = env.controller.tracker();

    let workflow_id = WorkflowId::new_v4();
    env.history_repo
        .seed_running(workflow_id, Some(seeded_tree(workflow_id)), None);
    env.broker.add_external_task(
        "worker-0",
        &workflow_id.to_string(),
        task_names::CALL_TRAIN,
        Some(project.as_str()),
    );

    let running = tracker.reconcile(&project).await.unwrap();
    assert!(running.contains(&workflow_id.to_string()));
    assert!(env.history_repo.row(workflow_id).unwrap().is_running());
}

#[test]
async fn unrelated_tasks_do_not_resurrect_anything() {
    let env = TestEnv::new().with_workers();
    let project = project_name();
    let tracker = env.controller.tracker();

    env.broker.add_external_task(
        "worker-0",
        &uuid::Uuid::new_v4().to_string(),
        "datamanagement.import_images",
        Some(project.as_str()),
    );
    let running = tracker.reconcile(&project).await.unwrap();
    assert!(running.is_empty());
    assert_eq!(env.history_repo.row_count(), 0);
}

// ---------------------------------------------------------------------------
// history deletion

#[test]
async fn history_deletion_skips_running_rows_unless_forced() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let running_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("alice"),
        )
        .await
        .unwrap();

    let finished_id = env
        .controller
        .launch_task(
            &project,
            WorkflowRef::Document(train_inference_doc()),
            Some("bob"),
        )
        .await
        .unwrap();
    env.broker.complete_all();
    env.controller
        .tracker()
        .poll_task_status(&project, finished_id)
        .await
        .unwrap();

    // without the flag only the finished row goes away
    let deleted = env
        .controller
        .delete_workflow_history(&project, HistorySelector::All, false)
        .await
        .unwrap();
    assert_eq!(deleted, vec![finished_id]);
    assert!(env.history_repo.row(running_id).is_some());

    // with the flag the running row is revoked and deleted
    let deleted = env
        .controller
        .delete_workflow_history(&project, HistorySelector::All, true)
        .await
        .unwrap();
    assert_eq!(deleted, vec![running_id]);
    assert!(env
        .broker
        .revoked_tasks()
        .contains(&TaskId(running_id.0)));
}

#[test]
async fn workflow_deletion_respects_ownership() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let id = env
        .controller
        .save_workflow(
            &project,
            "alice",
            &train_inference_doc().to_json(),
            None,
            "alice's workflow",
            false,
        )
        .await
        .unwrap();

    let deleted = env
        .controller
        .delete_workflow(&project, "mallory", &[id])
        .await
        .unwrap();
    assert!(deleted.is_empty());

    let deleted = env
        .controller
        .delete_workflow(&project, "alice", &[id])
        .await
        .unwrap();
    assert_eq!(deleted, vec![id]);
}

// ---------------------------------------------------------------------------
// model states and registry-backed operations

struct VerifierAdapter {
    verdict: Option<OptionsVerdict>,
    instantiate_error: Option<String>,
}

impl ModelAdapter for VerifierAdapter {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: Some("Box detector".to_string()),
            description: None,
            author: Some("annolab".to_string()),
            annotation_types: vec!["boundingBoxes".to_string()],
            prediction_types: vec!["boundingBoxes".to_string()],
            can_add_labelclasses: true,
        }
    }

    fn verify_options(&self, _options: &Value) -> Option<OptionsVerdict> {
        self.verdict.clone()
    }

    fn instantiate(&self, _project: &ProjectName, _options: &Value) -> Result<(), String> {
        match &self.instantiate_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

fn registry_with(verdict: Option<OptionsVerdict>, instantiate_error: Option<String>) -> ModelRegistry {
    ModelRegistry::bootstrap(
        vec![(
            "models.boxes".to_string(),
            Arc::new(VerifierAdapter {
                verdict,
                instantiate_error,
            }) as Arc<dyn ModelAdapter>,
        )],
        vec![],
    )
}

#[test]
async fn option_verification_falls_back_to_instantiation() {
    let mut project_record = test_project();
    project_record.ai_model_library = Some("models.boxes".to_string());
    let env = support::TestEnv::with_project_and_registry(
        project_record,
        registry_with(None, None),
    )
    .with_workers();
    let project = project_name();

    let verdict = env
        .controller
        .verify_ai_model_options(&project, &json!({"lr": 0.01}), None)
        .await
        .unwrap();
    assert!(verdict.valid);
    assert_eq!(verdict.warnings.len(), 1);

    // an explicit verifier verdict is passed through unchanged
    let env = support::TestEnv::with_project_and_registry(
        test_project(),
        registry_with(
            Some(OptionsVerdict::invalid(vec!["bad lr".to_string()])),
            None,
        ),
    );
    let verdict = env
        .controller
        .verify_ai_model_options(&project, &json!({"lr": -1}), Some("models.boxes"))
        .await
        .unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.errors, vec!["bad lr".to_string()]);
}

#[test]
async fn blank_model_library_disables_the_model() {
    let mut project_record = test_project();
    project_record.ai_model_library = Some("models.boxes".to_string());
    let env = support::TestEnv::with_project_and_registry(
        project_record,
        registry_with(None, None),
    );
    let project = project_name();

    let settings = json!({"ai_model_library": ""});
    env.controller
        .update_ai_model_settings(&project, settings.as_object().unwrap())
        .await
        .unwrap();

    let record = env.project_repo.projects.lock().unwrap()[&project].clone();
    assert!(!record.ai_model_enabled);
}

#[test]
async fn segmentation_projects_get_a_hidden_background_class() {
    let mut project_record = test_project();
    project_record.annotation_type = AnnotationType::SegmentationMasks;
    project_record.prediction_type = AnnotationType::SegmentationMasks;
    let env = support::TestEnv::with_project(project_record);
    let project = project_name();

    let settings = json!({"segmentation_ignore_unlabeled": false});
    env.controller
        .update_ai_model_settings(&project, settings.as_object().unwrap())
        .await
        .unwrap();

    let classes = env.labeling_repo.classes.lock().unwrap().clone();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0].name, "background");
    assert_eq!(classes[0].idx, 0);
    assert!(classes[0].hidden);

    // a second update does not add another class
    env.controller
        .update_ai_model_settings(&project, settings.as_object().unwrap())
        .await
        .unwrap();
    assert_eq!(env.labeling_repo.classes.lock().unwrap().len(), 1);
}

#[test]
async fn model_state_duplication_switches_the_project_library() {
    let env = TestEnv::new();
    let project = project_name();
    let control_tasks = ControlTasks::new(
        env.project_repo.clone(),
        env.labeling_repo.clone(),
        env.model_state_repo.clone(),
    );

    let old_state = env.model_state_repo.seed_state("models.legacy", 100);
    let latest_state = env.model_state_repo.seed_state("models.current", 10);
    env.project_repo
        .projects
        .lock()
        .unwrap()
        .get_mut(&project)
        .unwrap()
        .ai_model_library = Some("models.current".to_string());

    // duplicating the latest state with the skip flag is a no-op
    let unchanged = control_tasks
        .duplicate_model_state(&project, latest_state, true)
        .await
        .unwrap();
    assert_eq!(unchanged, latest_state);
    assert_eq!(env.model_state_repo.states.lock().unwrap().len(), 2);

    // duplicating an older state of another library switches the project
    let new_id = control_tasks
        .duplicate_model_state(&project, old_state, true)
        .await
        .unwrap();
    assert_ne!(new_id, old_state);
    let record = env.project_repo.projects.lock().unwrap()[&project].clone();
    assert_eq!(record.ai_model_library.as_deref(), Some("models.legacy"));
    assert!(record.ai_model_settings.is_none());

    // the copy is now the latest state
    let latest = env
        .model_state_repo
        .list_meta(&project, true)
        .await
        .unwrap();
    assert_eq!(latest[0].id, new_id);
}

#[test]
async fn training_statistics_series_pad_missing_keys() {
    let env = TestEnv::new();
    let project = project_name();
    let control_tasks = ControlTasks::new(
        env.project_repo.clone(),
        env.labeling_repo.clone(),
        env.model_state_repo.clone(),
    );

    let first = env.model_state_repo.seed_state("models.a", 100);
    let second = env.model_state_repo.seed_state("models.a", 50);
    {
        let mut states = env.model_state_repo.states.lock().unwrap();
        states[0].stats = Some(json!({"loss": 0.8}));
        states[1].stats = Some(json!({"loss": 0.5, "mAP": 0.62}));
    }

    let stats = control_tasks
        .get_model_training_statistics(&project, None, None, true)
        .await
        .unwrap();

    let ids = &stats.ids["models.a"];
    assert_eq!(ids, &vec![first.to_string(), second.to_string()]);
    let series = &stats.series["models.a"];
    assert_eq!(series["loss"], vec![json!(0.8), json!(0.5)]);
    // the first state has no mAP entry: padded with null
    assert_eq!(series["mAP"], vec![Value::Null, json!(0.62)]);
}

#[test]
async fn delete_model_states_reports_unknown_ids() {
    let env = TestEnv::new();
    let project = project_name();
    let control_tasks = ControlTasks::new(
        env.project_repo.clone(),
        env.labeling_repo.clone(),
        env.model_state_repo.clone(),
    );

    let known = env.model_state_repo.seed_state("models.a", 10);
    let missing = uuid::Uuid::new_v4().to_string();
    let invalid = control_tasks
        .delete_model_states(
            &project,
            &[known.to_string(), missing.clone(), "not-a-uuid".to_string()],
        )
        .await
        .unwrap();

    assert!(invalid.contains(&missing));
    assert!(invalid.contains(&"not-a-uuid".to_string()));
    assert!(env.model_state_repo.states.lock().unwrap().is_empty());
}

#[test]
async fn delegated_model_state_operations_return_task_ids() {
    let env = TestEnv::new().with_workers();
    let project = project_name();

    let state_id = env.model_state_repo.seed_state("models.a", 10);
    let task_a = env
        .controller
        .delete_model_states(&project, "alice", &[state_id.to_string()])
        .await
        .unwrap();
    let task_b = env
        .controller
        .duplicate_model_state(&project, "alice", state_id, true)
        .await
        .unwrap();
    let task_c = env
        .controller
        .get_model_training_stats(&project, "alice", None)
        .await
        .unwrap();

    assert_ne!(task_a, task_b);
    assert_ne!(task_b, task_c);
}
