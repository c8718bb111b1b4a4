use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use annolab_common::model::{AnnotationType, ProjectName};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

lazy_static! {
    static ref SCRIPT_PATTERN: Regex =
        Regex::new(r"(?is)<script\b.*?</script\s*>").expect("script pattern is valid");
}

fn strip_scripts(text: &str) -> String {
    SCRIPT_PATTERN.replace_all(text, "(script removed)").into_owned()
}

/// Static description a model implementation provides about itself.
/// Free-text fields are sanitised during registry bootstrap.
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub annotation_types: Vec<String>,
    pub prediction_types: Vec<String>,
    pub can_add_labelclasses: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionsVerdict {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl OptionsVerdict {
    pub fn valid() -> Self {
        OptionsVerdict {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        OptionsVerdict {
            valid: false,
            warnings: Vec::new(),
            errors,
        }
    }
}

/// Capability interface of a prediction or ranking model implementation.
/// Every capability beyond `metadata` is optional; `None` means the model
/// does not implement it and callers handle the unknown verdict explicitly.
pub trait ModelAdapter: Send + Sync {
    fn metadata(&self) -> ModelMetadata;

    /// Checks that the libraries the model depends on are present in this
    /// installation. Models failing the check are excluded at bootstrap.
    fn verify_requirements(&self) -> Result<(), String> {
        Ok(())
    }

    fn default_options(&self) -> Option<Value> {
        None
    }

    fn verify_options(&self, options: &Value) -> Option<OptionsVerdict> {
        let _ = options;
        None
    }

    /// Fallback check: build a configured instance and report whether that
    /// worked. Used when the model exposes no `verify_options`.
    fn instantiate(&self, project: &ProjectName, options: &Value) -> Result<(), String> {
        let _ = (project, options);
        Ok(())
    }
}

/// Sanitised, validated registry entry, frozen at bootstrap.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub key: String,
    pub name: String,
    pub description: String,
    pub author: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotation_types: Vec<AnnotationType>,
    pub prediction_types: Vec<AnnotationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_options: Option<Value>,
    pub can_add_labelclasses: bool,
}

impl ModelDescriptor {
    pub fn supports(&self, annotation_type: AnnotationType, prediction_type: AnnotationType) -> bool {
        self.annotation_types.contains(&annotation_type)
            && self.prediction_types.contains(&prediction_type)
    }
}

struct RegistryEntry {
    descriptor: ModelDescriptor,
    adapter: Arc<dyn ModelAdapter>,
}

/// Registry of discovered prediction and ranking (active-learning
/// criterion) models. Built once at startup and read-only afterwards.
pub struct ModelRegistry {
    prediction: BTreeMap<String, RegistryEntry>,
    ranking: BTreeMap<String, RegistryEntry>,
}

fn sanitise_types(
    key: &str,
    field: &str,
    values: &[String],
    warnings: &mut Vec<String>,
) -> Vec<AnnotationType> {
    let mut out = Vec::new();
    for value in values {
        match AnnotationType::from_str(value) {
            Ok(atype) => out.push(atype),
            Err(_) => warnings.push(format!("{key}: {field} \"{value}\" not understood.")),
        }
    }
    out
}

fn build_descriptor(
    key: &str,
    adapter: &Arc<dyn ModelAdapter>,
    require_annotation_types: bool,
    warnings: &mut Vec<String>,
) -> Option<ModelDescriptor> {
    if let Err(missing) = adapter.verify_requirements() {
        warnings.push(format!("{key}: {missing}"));
        return None;
    }
    let metadata = adapter.metadata();

    let name = metadata
        .name
        .as_deref()
        .map(strip_scripts)
        .unwrap_or_else(|| key.to_string());
    let description = metadata
        .description
        .as_deref()
        .map(strip_scripts)
        .unwrap_or_else(|| "(no description available)".to_string());
    let author = metadata
        .author
        .as_deref()
        .map(strip_scripts)
        .unwrap_or_else(|| "(unknown)".to_string());

    let annotation_types = sanitise_types(
        key,
        "annotationType",
        &metadata.annotation_types,
        warnings,
    );
    let prediction_types = sanitise_types(
        key,
        "predictionType",
        &metadata.prediction_types,
        warnings,
    );

    if require_annotation_types && annotation_types.is_empty() {
        warnings.push(format!("{key}: missing or invalid annotationType."));
        return None;
    }
    if prediction_types.is_empty() {
        warnings.push(format!("{key}: missing or invalid predictionType."));
        return None;
    }

    Some(ModelDescriptor {
        key: key.to_string(),
        name,
        description,
        author,
        annotation_types,
        prediction_types,
        default_options: adapter.default_options(),
        can_add_labelclasses: metadata.can_add_labelclasses,
    })
}

impl ModelRegistry {
    pub fn bootstrap(
        prediction: Vec<(String, Arc<dyn ModelAdapter>)>,
        ranking: Vec<(String, Arc<dyn ModelAdapter>)>,
    ) -> Self {
        let mut warnings = Vec::new();
        let mut prediction_map = BTreeMap::new();
        for (key, adapter) in prediction {
            match build_descriptor(&key, &adapter, true, &mut warnings) {
                Some(descriptor) => {
                    prediction_map.insert(key, RegistryEntry { descriptor, adapter });
                }
                None => warnings.push(format!("Prediction model \"{key}\" is not available.")),
            }
        }

        let mut ranking_map = BTreeMap::new();
        for (key, adapter) in ranking {
            match build_descriptor(&key, &adapter, false, &mut warnings) {
                Some(descriptor) => {
                    ranking_map.insert(key, RegistryEntry { descriptor, adapter });
                }
                None => warnings.push(format!("Ranking model \"{key}\" is not available.")),
            }
        }

        for warning in &warnings {
            warn!("Model registry: {warning}");
        }

        ModelRegistry {
            prediction: prediction_map,
            ranking: ranking_map,
        }
    }

    pub fn empty() -> Self {
        ModelRegistry {
            prediction: BTreeMap::new(),
            ranking: BTreeMap::new(),
        }
    }

    pub fn prediction_descriptor(&self, key: &str) -> Option<&ModelDescriptor> {
        self.prediction.get(key).map(|entry| &entry.descriptor)
    }

    pub fn prediction_adapter(&self, key: &str) -> Option<Arc<dyn ModelAdapter>> {
        self.prediction.get(key).map(|entry| entry.adapter.clone())
    }

    pub fn ranking_descriptor(&self, key: &str) -> Option<&ModelDescriptor> {
        self.ranking.get(key).map(|entry| &entry.descriptor)
    }

    pub fn prediction_descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.prediction.values().map(|entry| &entry.descriptor)
    }

    pub fn ranking_descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.ranking.values().map(|entry| &entry.descriptor)
    }

    /// Prediction models compatible with a project's annotation and
    /// prediction types; ranking models are returned unfiltered.
    pub fn prediction_descriptors_for(
        &self,
        annotation_type: AnnotationType,
        prediction_type: AnnotationType,
    ) -> impl Iterator<Item = &ModelDescriptor> {
        self.prediction_descriptors()
            .filter(move |descriptor| descriptor.supports(annotation_type, prediction_type))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    struct TestAdapter {
        metadata: ModelMetadata,
    }

    impl ModelAdapter for TestAdapter {
        fn metadata(&self) -> ModelMetadata {
            self.metadata.clone()
        }

        fn default_options(&self) -> Option<Value> {
            Some(serde_json::json!({"learning_rate": 1e-4}))
        }
    }

    fn adapter(metadata: ModelMetadata) -> Arc<dyn ModelAdapter> {
        Arc::new(TestAdapter { metadata })
    }

    #[test]
    fn bootstrap_sanitises_and_validates() {
        let registry = ModelRegistry::bootstrap(
            vec![(
                "models.retina".to_string(),
                adapter(ModelMetadata {
                    name: Some("Retina<script>alert('x')</script>".to_string()),
                    description: None,
                    author: Some("annolab".to_string()),
                    annotation_types: vec!["boundingBoxes".to_string(), "hexagons".to_string()],
                    prediction_types: vec!["boundingBoxes".to_string()],
                    can_add_labelclasses: true,
                }),
            )],
            vec![],
        );

        let descriptor = registry.prediction_descriptor("models.retina").unwrap();
        assert_eq!(descriptor.name, "Retina(script removed)");
        assert_eq!(descriptor.description, "(no description available)");
        assert_eq!(descriptor.annotation_types, vec![AnnotationType::BoundingBoxes]);
        assert!(descriptor.default_options.is_some());
    }

    #[test]
    fn models_with_missing_requirements_are_excluded() {
        struct UnsatisfiedAdapter;

        impl ModelAdapter for UnsatisfiedAdapter {
            fn metadata(&self) -> ModelMetadata {
                ModelMetadata {
                    annotation_types: vec!["labels".to_string()],
                    prediction_types: vec!["labels".to_string()],
                    ..ModelMetadata::default()
                }
            }

            fn verify_requirements(&self) -> Result<(), String> {
                Err("Required library \"libtorch\" not installed.".to_string())
            }
        }

        let registry = ModelRegistry::bootstrap(
            vec![(
                "models.torch".to_string(),
                Arc::new(UnsatisfiedAdapter) as Arc<dyn ModelAdapter>,
            )],
            vec![],
        );
        assert!(registry.prediction_descriptor("models.torch").is_none());
    }

    #[test]
    fn models_without_valid_types_are_excluded() {
        let registry = ModelRegistry::bootstrap(
            vec![(
                "models.broken".to_string(),
                adapter(ModelMetadata {
                    annotation_types: vec!["hexagons".to_string()],
                    prediction_types: vec!["labels".to_string()],
                    ..ModelMetadata::default()
                }),
            )],
            vec![],
        );
        assert!(registry.prediction_descriptor("models.broken").is_none());
    }

    #[test]
    fn project_type_filter_applies_to_prediction_models() {
        let registry = ModelRegistry::bootstrap(
            vec![
                (
                    "models.boxes".to_string(),
                    adapter(ModelMetadata {
                        annotation_types: vec!["boundingBoxes".to_string()],
                        prediction_types: vec!["boundingBoxes".to_string()],
                        ..ModelMetadata::default()
                    }),
                ),
                (
                    "models.seg".to_string(),
                    adapter(ModelMetadata {
                        annotation_types: vec!["segmentationMasks".to_string()],
                        prediction_types: vec!["segmentationMasks".to_string()],
                        ..ModelMetadata::default()
                    }),
                ),
            ],
            vec![],
        );

        let compatible: Vec<&str> = registry
            .prediction_descriptors_for(
                AnnotationType::BoundingBoxes,
                AnnotationType::BoundingBoxes,
            )
            .map(|descriptor| descriptor.key.as_str())
            .collect();
        assert_eq!(compatible, vec!["models.boxes"]);
    }
}
