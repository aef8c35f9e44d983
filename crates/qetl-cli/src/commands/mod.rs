//! CLI command implementations.

pub mod info;
pub mod jobs;

use anyhow::{Context, Result};
use qetl_config::SystemConfig;
use qetl_config::pipeline::load_pipeline;
use qetl_executor::ProcessExecutor;
use qetl_scheduler::{Manager, ManagerConfig};
use std::path::Path;
use std::sync::Arc;

/// Build a job manager backed by the subprocess executor.
pub fn manager(config: &SystemConfig) -> Result<Manager> {
    let executor =
        ProcessExecutor::from_system_config(config).context("Failed to set up the QETL executor")?;
    Ok(Manager::new(Arc::new(executor), ManagerConfig::from(config)))
}

/// Load a pipeline document and check it the way `submit` would.
pub fn validate(manager: &Manager, path: &Path, json: bool) -> Result<()> {
    let spec = load_pipeline(path)
        .with_context(|| format!("Failed to load pipeline: {}", path.display()))?;
    let report = manager.validate(&spec);

    if json {
        let body = serde_json::to_string_pretty(&report).context("Failed to encode report")?;
        println!("{}", body);
    } else if report.valid {
        println!("✓ {}", report.message);
        if let Some(name) = &report.pipeline_name {
            println!("  Pipeline: {}", name);
        }
        println!("  Inputs: {}", spec.inputs.len());
        println!("  Transformations: {}", spec.transformations.len());
        println!("  Outputs: {}", spec.outputs.len());
    } else {
        println!("✗ Configuration is invalid: {}", report.message);
    }

    if !report.valid {
        anyhow::bail!("Validation failed for {}", path.display());
    }
    Ok(())
}
