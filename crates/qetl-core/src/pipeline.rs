//! Pipeline definitions.
//!
//! A [`PipelineSpec`] is produced by a collaborator (the KDL loader in
//! `qetl-config` or [`PipelineBuilder`]) and treated as opaque by the job
//! manager, which only re-checks that the required sections are present.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// A declarative data pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name.
    #[serde(rename = "pipeline_name", default)]
    pub name: String,
    /// Pipeline version.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data sources read by the pipeline.
    #[serde(rename = "input_sources", default)]
    pub inputs: Vec<InputSource>,
    /// Processing steps, in declaration order.
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    /// Where results are written.
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Scheduling hints.
    #[serde(default)]
    pub execution: ExecutionParams,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// An input data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSource {
    pub name: String,
    pub path: String,
    /// Source format (csv, json, pdb, ...). Detected by the executor when absent.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// A processing step backed by a named component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Names of transformations that must run first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl Transformation {
    /// The name other steps refer to: the explicit name, else the component.
    pub fn key(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.component)
    }
}

/// An output destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub path: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

fn default_format() -> String {
    "json".to_string()
}

/// Execution parameters attached to a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// 1-100, higher runs first where the backend supports priorities.
    pub priority: u8,
    /// Wall-clock limit for the executor, overriding the manager default.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<String>,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            priority: 50,
            timeout_secs: None,
            notifications: Vec::new(),
        }
    }
}

impl PipelineSpec {
    /// Start building a pipeline programmatically.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// Check that the required top-level sections are present.
    ///
    /// This is the minimal check the job manager runs before and after
    /// submission. Deeper checks belong to whoever produced the spec.
    pub fn validate_structure(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("Missing required field: pipeline_name".to_string());
        }
        if self.inputs.is_empty() {
            errors.push("Missing required field: input_sources".to_string());
        }
        if self.transformations.is_empty() {
            errors.push("Missing required field: transformations".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors.join("; ")))
        }
    }

    /// Per-job executor timeout, if the pipeline sets one.
    pub fn timeout(&self) -> Option<Duration> {
        self.execution.timeout_secs.map(Duration::from_secs)
    }
}

/// Builder for constructing a [`PipelineSpec`] in code.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    spec: PipelineSpec,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: PipelineSpec {
                name: name.into(),
                version: default_version(),
                description: None,
                inputs: Vec::new(),
                transformations: Vec::new(),
                outputs: Vec::new(),
                execution: ExecutionParams::default(),
            },
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.spec.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = Some(description.into());
        self
    }

    pub fn input(self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.input_source(InputSource {
            name: name.into(),
            path: path.into(),
            source_type: None,
            config: None,
        })
    }

    pub fn input_source(mut self, source: InputSource) -> Self {
        self.spec.inputs.push(source);
        self
    }

    pub fn transformation(self, component: impl Into<String>) -> Self {
        self.step(Transformation {
            component: component.into(),
            name: None,
            config: None,
            dependencies: Vec::new(),
        })
    }

    pub fn step(mut self, transformation: Transformation) -> Self {
        self.spec.transformations.push(transformation);
        self
    }

    fn component_step(self, component: &str, config: serde_json::Value) -> Self {
        self.step(Transformation {
            component: component.to_string(),
            name: None,
            config: Some(config),
            dependencies: Vec::new(),
        })
    }

    pub fn wave_encoder(self, encoding_type: impl Into<String>) -> Self {
        let encoding_type = encoding_type.into();
        self.component_step(
            "wave_encoder",
            serde_json::json!({ "encoding_type": encoding_type }),
        )
    }

    pub fn wave_decoder(self, decoding_type: impl Into<String>) -> Self {
        let decoding_type = decoding_type.into();
        self.component_step(
            "wave_decoder",
            serde_json::json!({ "decoding_type": decoding_type }),
        )
    }

    /// `precision` is one of `low`, `medium` or `high`.
    pub fn quantum_homology_analyzer(self, dimensions: u32, precision: impl Into<String>) -> Self {
        let precision = precision.into();
        self.component_step(
            "quantum_homology_analyzer",
            serde_json::json!({ "dimensions": dimensions, "precision": precision }),
        )
    }

    /// `optimization_level` ranges from 1 to 3.
    pub fn williams_pebbler(self, optimization_level: u8) -> Self {
        self.component_step(
            "williams_pebbler",
            serde_json::json!({ "optimization_level": optimization_level.clamp(1, 3) }),
        )
    }

    pub fn holographic_grover(self, search_iterations: u32) -> Self {
        self.component_step(
            "holographic_grover",
            serde_json::json!({ "search_iterations": search_iterations }),
        )
    }

    /// Name the most recently added transformation.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let Some(last) = self.spec.transformations.last_mut() {
            last.name = Some(name.into());
        }
        self
    }

    /// Make the most recently added transformation depend on `step`.
    pub fn after(mut self, step: impl Into<String>) -> Self {
        if let Some(last) = self.spec.transformations.last_mut() {
            last.dependencies.push(step.into());
        }
        self
    }

    pub fn output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.spec.outputs.push(OutputSpec {
            name: name.into(),
            path: path.into(),
            format: default_format(),
            config: None,
        });
        self
    }

    pub fn output_spec(mut self, output: OutputSpec) -> Self {
        self.spec.outputs.push(output);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.spec.execution.priority = priority.clamp(1, 100);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.execution.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn notify(mut self, endpoint: impl Into<String>) -> Self {
        self.spec.execution.notifications.push(endpoint.into());
        self
    }

    /// Validate the configuration without consuming the builder.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.spec.name.trim().is_empty() {
            errors.push("Pipeline name is required".to_string());
        }
        if self.spec.inputs.is_empty() {
            errors.push("At least one input source is required".to_string());
        }
        if self.spec.transformations.is_empty() {
            errors.push("At least one transformation is required".to_string());
        }

        let known: HashSet<&str> = self
            .spec
            .transformations
            .iter()
            .filter_map(|t| t.name.as_deref())
            .collect();
        for transformation in &self.spec.transformations {
            for dep in &transformation.dependencies {
                if !known.contains(dep.as_str()) {
                    errors.push(format!("Unknown dependency: {}", dep));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors.join("; ")))
        }
    }

    pub fn build(self) -> Result<PipelineSpec> {
        self.validate()?;
        Ok(self.spec)
    }

    /// The pipeline document as pretty-printed JSON, unvalidated.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.spec).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Write the pipeline document to `path` as JSON. The file loads back
    /// through `qetl_config::load_pipeline`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| Error::Internal(format!("failed to write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_spec() -> PipelineSpec {
        PipelineSpec::builder("customer-etl")
            .description("Nightly customer load")
            .input("customers", "data/customers.csv")
            .step(Transformation {
                component: "wave_encoder".to_string(),
                name: Some("encode".to_string()),
                config: Some(serde_json::json!({"dimensions": 4})),
                dependencies: vec![],
            })
            .step(Transformation {
                component: "quantum_homology_analyzer".to_string(),
                name: Some("analyze".to_string()),
                config: None,
                dependencies: vec!["encode".to_string()],
            })
            .output("report", "out/report.json")
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_produces_valid_spec() {
        let spec = make_spec();
        assert_eq!(spec.name, "customer-etl");
        assert_eq!(spec.version, "1.0");
        assert_eq!(spec.transformations.len(), 2);
        assert_eq!(spec.timeout(), Some(Duration::from_secs(120)));
        assert!(spec.validate_structure().is_ok());
    }

    #[test]
    fn test_builder_rejects_missing_sections() {
        let err = PipelineSpec::builder("empty").build().unwrap_err();
        match err {
            Error::Validation(msg) => {
                assert!(msg.contains("input source"));
                assert!(msg.contains("transformation"));
            }
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_builder_rejects_unknown_dependency() {
        let err = PipelineSpec::builder("deps")
            .input("a", "a.csv")
            .step(Transformation {
                component: "wave_decoder".to_string(),
                name: Some("decode".to_string()),
                config: None,
                dependencies: vec!["encode".to_string()],
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Unknown dependency: encode"));
    }

    #[test]
    fn test_structure_check_names_missing_transformations() {
        let mut spec = make_spec();
        spec.transformations.clear();
        let err = spec.validate_structure().unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("transformations")));
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(make_spec()).unwrap();
        assert_eq!(json["pipeline_name"], "customer-etl");
        assert_eq!(json["input_sources"][0]["path"], "data/customers.csv");
        assert_eq!(json["transformations"][1]["dependencies"][0], "encode");
        assert_eq!(json["outputs"][0]["format"], "json");
        assert_eq!(json["execution"]["timeout"], 120);
    }

    #[test]
    fn test_missing_sections_deserialize_as_empty() {
        let spec: PipelineSpec = serde_json::from_value(serde_json::json!({
            "pipeline_name": "partial",
            "input_sources": [{"name": "a", "path": "a.csv"}]
        }))
        .unwrap();
        assert!(spec.transformations.is_empty());
        assert_eq!(spec.execution.priority, 50);
        assert!(spec.validate_structure().is_err());
    }

    #[test]
    fn test_component_shortcuts_chain_dependencies() {
        let spec = PipelineSpec::builder("molecules")
            .input("proteins", "data/proteins.pdb")
            .wave_encoder("molecular_orbital")
            .named("encode")
            .holographic_grover(500)
            .named("search")
            .after("encode")
            .williams_pebbler(7)
            .build()
            .unwrap();

        let steps = &spec.transformations;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].component, "wave_encoder");
        assert_eq!(
            steps[0].config.as_ref().unwrap()["encoding_type"],
            "molecular_orbital"
        );
        assert_eq!(steps[1].key(), "search");
        assert_eq!(steps[1].dependencies, vec!["encode".to_string()]);
        assert_eq!(steps[2].config.as_ref().unwrap()["optimization_level"], 3);
    }

    #[test]
    fn test_builder_saves_loadable_json() {
        let builder = PipelineSpec::builder("exported")
            .input("a", "a.csv")
            .quantum_homology_analyzer(4, "high")
            .wave_decoder("quantum_fourier")
            .output("report", "out/report.json");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported.json");
        builder.save(&path).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let loaded: PipelineSpec = serde_json::from_str(&body).unwrap();
        assert_eq!(loaded, builder.build().unwrap());
    }

    #[test]
    fn test_transformation_key_falls_back_to_component() {
        let step = Transformation {
            component: "williams_pebbler".to_string(),
            name: None,
            config: None,
            dependencies: vec![],
        };
        assert_eq!(step.key(), "williams_pebbler");
    }
}
