//! Executor trait and execution types.
//!
//! Executors run a pipeline to completion outside the job manager
//! (a subprocess, a library, a remote service).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::PipelineSpec;
use crate::{JobId, Result};

/// Raw payload returned by a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Named outputs produced by the pipeline.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Log lines captured during execution.
    #[serde(default)]
    pub logs: Vec<String>,
    /// Free-form execution metrics.
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// A processing component an executor can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    #[serde(rename = "type")]
    pub component_type: String,
}

/// Trait for pipeline executors.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a pipeline to completion.
    ///
    /// Dropping the returned future must abandon the execution.
    async fn execute(&self, job_id: JobId, spec: &PipelineSpec) -> Result<ExecutionOutput>;

    /// Ask a running execution to stop. Best effort.
    async fn terminate(&self, job_id: JobId) -> Result<()>;

    /// Components this executor knows how to run.
    fn components(&self) -> Vec<ComponentInfo> {
        Vec::new()
    }
}
