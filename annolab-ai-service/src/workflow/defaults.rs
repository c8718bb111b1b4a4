use serde_json::json;

use crate::model::{Kwargs, TaskKind, WorkflowDocument};

/// Built-in kwarg defaults per task type, used to auto-complete submitted
/// workflows after document options and project defaults have been applied.
pub fn default_workflow_args(kind: TaskKind) -> Option<Kwargs> {
    let value = match kind {
        TaskKind::Train => json!({
            "min_timestamp": "lastState",
            "min_anno_per_image": 0,
            "include_golden_questions": false,
            "max_num_images": -1,
            "max_num_workers": -1
        }),
        TaskKind::Inference => json!({
            "force_unlabeled": false,
            "golden_questions_only": false,
            "max_num_images": -1,
            "max_num_workers": -1
        }),
        TaskKind::Repeater | TaskKind::Connector => return None,
    };
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Workflow to execute on auto-training if the project has no default
/// workflow set. The watchdog overrides some parameters (image caps, worker
/// counts) from the project settings before launching it.
pub fn default_autotrain_workflow() -> WorkflowDocument {
    serde_json::from_value(json!({
        "tasks": [
            {
                "id": "default_train",
                "type": "train",
                "kwargs": {
                    "min_timestamp": "lastState",
                    "numEpochs": 1,
                    "min_anno_per_image": 0,
                    "include_golden_questions": true,
                    "max_num_images": 0,
                    "max_num_workers": 1
                }
            },
            {
                "id": "default_inference",
                "type": "inference",
                "kwargs": {
                    "force_unlabeled": true,
                    "golden_questions_only": false,
                    "numEpochs": 1,
                    "max_num_workers": 1
                }
            }
        ]
    }))
    .expect("auto-train workflow is well-formed")
}
