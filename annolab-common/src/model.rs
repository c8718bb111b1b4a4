use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::newtype_uuid;

newtype_uuid!(WorkflowId);
newtype_uuid!(ModelStateId);
newtype_uuid!(TaskId);

/// Project shortname, doubling as the project's database schema name.
///
/// Validated on construction so that it can be interpolated into
/// schema-qualified identifiers without further escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, String> {
        let name = name.into();
        if name.is_empty() || name.len() > 63 {
            return Err(format!(
                "Invalid project name \"{name}\": must be 1-63 characters long"
            ));
        }
        let mut chars = name.chars();
        let first = chars.next().unwrap();
        if !(first.is_ascii_lowercase() || first == '_') {
            return Err(format!(
                "Invalid project name \"{name}\": must start with a lowercase letter or underscore"
            ));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(format!(
                "Invalid project name \"{name}\": only lowercase letters, digits and underscores are allowed"
            ));
        }
        Ok(ProjectName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Schema-qualified identifier for a table in this project's namespace.
    pub fn qualify(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.0, table)
    }
}

impl Display for ProjectName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ProjectName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProjectName::new(value)
    }
}

impl From<ProjectName> for String {
    fn from(value: ProjectName) -> Self {
        value.0
    }
}

impl FromStr for ProjectName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProjectName::new(s)
    }
}

/// The annotation (and prediction) geometries supported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnotationType {
    #[serde(rename = "labels")]
    Labels,
    #[serde(rename = "points")]
    Points,
    #[serde(rename = "boundingBoxes")]
    BoundingBoxes,
    #[serde(rename = "polygons")]
    Polygons,
    #[serde(rename = "segmentationMasks")]
    SegmentationMasks,
}

impl AnnotationType {
    pub fn all() -> &'static [AnnotationType] {
        &[
            AnnotationType::Labels,
            AnnotationType::Points,
            AnnotationType::BoundingBoxes,
            AnnotationType::Polygons,
            AnnotationType::SegmentationMasks,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationType::Labels => "labels",
            AnnotationType::Points => "points",
            AnnotationType::BoundingBoxes => "boundingBoxes",
            AnnotationType::Polygons => "polygons",
            AnnotationType::SegmentationMasks => "segmentationMasks",
        }
    }
}

impl Display for AnnotationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnnotationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "labels" => Ok(AnnotationType::Labels),
            "points" => Ok(AnnotationType::Points),
            "boundingBoxes" => Ok(AnnotationType::BoundingBoxes),
            "polygons" => Ok(AnnotationType::Polygons),
            "segmentationMasks" => Ok(AnnotationType::SegmentationMasks),
            other => Err(format!("Unknown annotation type: {other}")),
        }
    }
}

/// Central per-project record (`annolab_admin.project`), read-only for the
/// AI service except for the model-settings updates of the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub shortname: ProjectName,
    pub annotation_type: AnnotationType,
    pub prediction_type: AnnotationType,
    pub ai_model_enabled: bool,
    pub ai_model_library: Option<String>,
    pub ai_model_settings: Option<serde_json::Value>,
    pub ai_alcriterion_library: Option<String>,
    pub ai_alcriterion_settings: Option<serde_json::Value>,
    /// Auto-train threshold; zero or negative disables auto-training.
    pub numimages_autotrain: i32,
    pub minnumannoperimage: i32,
    pub maxnumimages_train: i32,
    pub maxnumimages_inference: i32,
    /// Per-project cap on concurrently running tasks; zero or negative
    /// means unlimited (the global ceiling still applies).
    pub max_num_concurrent_tasks: i32,
    pub default_workflow: Option<WorkflowId>,
    pub segmentation_ignore_unlabeled: bool,
    pub labelclass_autoupdate: bool,
}
