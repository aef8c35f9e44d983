//! Uniform wrapper around a [`PipelineExecutor`].
//!
//! The adapter owns the policies shared by every backend: the wall-clock
//! limit, cancellation, panic isolation, and error classification.

use futures::FutureExt;
use qetl_core::executor::{ExecutionOutput, PipelineExecutor};
use qetl_core::job::FailureKind;
use qetl_core::pipeline::PipelineSpec;
use qetl_core::{Error, JobId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Normalized result of one execution attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded {
        output: ExecutionOutput,
        elapsed: Duration,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
    Cancelled,
}

/// Runs pipelines on an executor with timeout and cancellation.
#[derive(Clone)]
pub struct ExecutorAdapter {
    executor: Arc<dyn PipelineExecutor>,
}

impl ExecutorAdapter {
    pub fn new(executor: Arc<dyn PipelineExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn PipelineExecutor> {
        &self.executor
    }

    /// Execute `spec`, giving up after `timeout` or when `token` fires.
    ///
    /// Never retries. On timeout or cancellation the in-flight execution is
    /// dropped and the executor is asked to terminate it.
    pub async fn run(
        &self,
        job_id: JobId,
        spec: &PipelineSpec,
        timeout: Duration,
        token: &CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let execution = AssertUnwindSafe(self.executor.execute(job_id, spec)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = tokio::time::timeout(timeout, execution) => Some(result),
        };

        match result {
            None => {
                debug!(job_id = %job_id, "execution cancelled");
                self.terminate(job_id).await;
                ExecutionOutcome::Cancelled
            }
            Some(Err(_elapsed)) => {
                warn!(job_id = %job_id, timeout_secs = timeout.as_secs_f64(), "execution timed out");
                self.terminate(job_id).await;
                ExecutionOutcome::Failed {
                    kind: FailureKind::Timeout,
                    message: format!(
                        "Pipeline execution timed out after {} seconds",
                        timeout.as_secs_f64()
                    ),
                }
            }
            Some(Ok(Err(panic))) => ExecutionOutcome::Failed {
                kind: FailureKind::ExecutionFailed,
                message: format!("Executor panicked: {}", panic_message(panic.as_ref())),
            },
            Some(Ok(Ok(Err(err)))) => classify(err),
            Some(Ok(Ok(Ok(output)))) => ExecutionOutcome::Succeeded {
                output,
                elapsed: started.elapsed(),
            },
        }
    }

    async fn terminate(&self, job_id: JobId) {
        if let Err(e) = self.executor.terminate(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to terminate execution");
        }
    }
}

fn classify(err: Error) -> ExecutionOutcome {
    match err {
        Error::Timeout(message) => ExecutionOutcome::Failed {
            kind: FailureKind::Timeout,
            message,
        },
        Error::ExecutionFailed(message) => ExecutionOutcome::Failed {
            kind: FailureKind::ExecutionFailed,
            message,
        },
        other => ExecutionOutcome::Failed {
            kind: FailureKind::ExecutionFailed,
            message: other.to_string(),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
