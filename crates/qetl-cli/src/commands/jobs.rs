//! Job submission command.

use anyhow::{Context, Result};
use futures::future::join_all;
use qetl_config::pipeline::load_pipeline;
use qetl_core::job::{JobState, JobStatus};
use qetl_scheduler::{JobHandle, Manager};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SubmitOptions {
    pub timeout: Option<u64>,
    pub show_results: bool,
    pub json: bool,
    pub output: Option<PathBuf>,
    pub list_limit: usize,
}

/// Submit every pipeline, follow them to completion, and report.
pub async fn submit(manager: &Manager, files: &[PathBuf], options: &SubmitOptions) -> Result<()> {
    let mut jobs: Vec<(String, JobHandle)> = Vec::new();

    for file in files {
        let mut spec = load_pipeline(file)
            .with_context(|| format!("Failed to load pipeline: {}", file.display()))?;
        if let Some(timeout) = options.timeout {
            spec.execution.timeout_secs = Some(timeout);
        }
        debug!(path = %file.display(), pipeline = %spec.name, "Loaded pipeline");

        let label = spec.name.clone();
        let handle = manager
            .submit(spec)
            .with_context(|| format!("Failed to submit pipeline: {}", file.display()))?;
        println!("▶ Submitted '{}' as job {}", label, handle.id());

        let prefix = label.clone();
        handle.on_status_change(move |status: &JobStatus| print_status(&prefix, status))?;
        jobs.push((label, handle));
    }

    let waits = join_all(jobs.iter().map(|(_, job)| job.wait_until_complete(None)));
    tokio::select! {
        _ = waits => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, cancelling jobs...");
            for (_, job) in &jobs {
                job.cancel()?;
            }
            for (_, job) in &jobs {
                // Give runners a moment to record the cancellation.
                if let Err(e) = job.wait_until_complete(Some(Duration::from_secs(5))).await {
                    warn!(job_id = %job.id(), error = %e, "Job did not settle after cancellation");
                }
            }
        }
    }

    println!("\n--- Job Summary ---");
    for job in manager.list(None, options.list_limit) {
        let status = job.status()?;
        let marker = match status.state {
            JobState::Completed => "✓",
            JobState::Failed => "✗",
            JobState::Cancelled => "⊘",
            _ => "○",
        };
        println!(
            "  {} {} - {} ({})",
            marker, status.job_id, status.state, status.message
        );
    }

    let mut unsuccessful = 0;
    for (label, job) in &jobs {
        if !job.is_successful()? {
            unsuccessful += 1;
            continue;
        }
        if options.show_results || options.output.is_some() {
            let results = job.results().await?;
            if options.show_results {
                print_results(label, &results, options.json)?;
            }
            if let Some(output) = &options.output {
                let path = output_path(output, job, jobs.len() > 1);
                results
                    .save_to_file(&path)
                    .with_context(|| format!("Failed to save results to {}", path.display()))?;
                println!("Results for '{}' saved to {}", label, path.display());
            }
        }
    }

    if unsuccessful > 0 {
        anyhow::bail!("{} of {} jobs did not complete", unsuccessful, jobs.len());
    }
    println!("\n✓ All jobs completed");
    Ok(())
}

fn print_status(label: &str, status: &JobStatus) {
    match status.progress {
        Some(progress) => println!(
            "  [{}] {:<12} {:>5.1}%  {}",
            label, status.state, progress, status.message
        ),
        None => println!("  [{}] {:<12}         {}", label, status.state, status.message),
    }
}

fn print_results(label: &str, results: &qetl_core::JobResults, json: bool) -> Result<()> {
    if json {
        let body = serde_json::to_string_pretty(&results.to_json())
            .context("Failed to encode results")?;
        println!("{}", body);
        return Ok(());
    }

    println!("\nResults for '{}':", label);
    println!("  Execution time: {:.2}s", results.execution_time());
    for (name, value) in results.outputs() {
        println!("  {}: {}", name, value);
    }
    Ok(())
}

/// With several jobs, each gets its own file: `report.json` becomes
/// `report.<job-id>.json`.
fn output_path(base: &Path, job: &JobHandle, many: bool) -> PathBuf {
    if !many {
        return base.to_path_buf();
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    let file_name = match base.extension() {
        Some(ext) => format!("{}.{}.{}", stem, job.id(), ext.to_string_lossy()),
        None => format!("{}.{}", stem, job.id()),
    };
    base.with_file_name(file_name)
}
