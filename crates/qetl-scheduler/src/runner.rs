//! Background driver for one job's lifecycle.

use crate::manager::Shared;
use qetl_core::job::{FailureKind, JobResults, JobState};
use qetl_core::pipeline::PipelineSpec;
use qetl_core::{Error, JobId, Result};
use qetl_executor::ExecutionOutcome;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives a job from SUBMITTED to a terminal state.
pub(crate) struct JobRunner {
    shared: Arc<Shared>,
    id: JobId,
    spec: Arc<PipelineSpec>,
    token: CancellationToken,
}

impl JobRunner {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: JobId,
        spec: Arc<PipelineSpec>,
        token: CancellationToken,
    ) -> Self {
        Self {
            shared,
            id,
            spec,
            token,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        match self.drive().await {
            Ok(()) => {}
            // Someone else (usually cancel) already finished the job.
            Err(Error::InvalidTransition { from, to }) => {
                debug!(job_id = %self.id, %from, %to, "job finished elsewhere, runner stopping");
            }
            Err(e) => {
                error!(job_id = %self.id, error = %e, "job runner failed");
                if let Err(e) = self.fail(FailureKind::ExecutionFailed, e.to_string()) {
                    debug!(job_id = %self.id, error = %e, "could not record runner failure");
                }
            }
        }
        self.shared.release_token(self.id);
    }

    async fn drive(&self) -> Result<()> {
        self.step(JobState::Validating, 10.0, "Validating configuration")?;
        if let Err(e) = self.spec.validate_structure() {
            let message = match e {
                Error::Validation(message) => message,
                other => other.to_string(),
            };
            return self.fail(FailureKind::Validation, message);
        }

        self.step(JobState::Queued, 20.0, "Job queued for execution")?;
        self.step(
            JobState::Initializing,
            30.0,
            "Initializing execution environment",
        )?;
        self.step(JobState::Running, 40.0, "Executing pipeline")?;

        let timeout = self
            .spec
            .timeout()
            .unwrap_or(self.shared.config.execution_timeout);
        let outcome = self
            .shared
            .adapter
            .run(self.id, &self.spec, timeout, &self.token)
            .await;

        match outcome {
            ExecutionOutcome::Succeeded { output, elapsed } => {
                self.step(JobState::Completing, 90.0, "Processing results")?;
                let results = JobResults::new(
                    self.id,
                    output.outputs,
                    elapsed,
                    output.logs,
                    output.metrics,
                );
                self.shared
                    .store
                    .update(self.id, |r| r.complete(results, "Job completed successfully"))?;
                info!(
                    job_id = %self.id,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "job completed"
                );
                Ok(())
            }
            ExecutionOutcome::Failed { kind, message } => self.fail(kind, message),
            ExecutionOutcome::Cancelled => self.mark_cancelled(),
        }
    }

    /// Advance one happy-path step, unless the job has been cancelled.
    fn step(&self, state: JobState, progress: f64, message: &str) -> Result<()> {
        if self.token.is_cancelled() {
            self.mark_cancelled()?;
            return Err(Error::InvalidTransition {
                from: JobState::Cancelled,
                to: state,
            });
        }
        self.shared
            .store
            .update(self.id, |r| r.advance(state, progress, message))?;
        debug!(job_id = %self.id, state = %state, progress, "job advanced");
        Ok(())
    }

    fn fail(&self, kind: FailureKind, message: String) -> Result<()> {
        warn!(job_id = %self.id, kind = %kind, error = %message, "job failed");
        self.shared
            .store
            .update(self.id, |r| r.fail(kind, message))?;
        Ok(())
    }

    fn mark_cancelled(&self) -> Result<()> {
        match self.shared.store.update(self.id, |r| r.cancel("Job cancelled")) {
            Ok(_) => {
                info!(job_id = %self.id, "job cancelled");
                Ok(())
            }
            Err(Error::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
