//! Job lifecycle types.
//!
//! A [`JobRecord`] is the authoritative state of one submitted job. It only
//! changes through its transition methods, which enforce the lifecycle:
//!
//! ```text
//! submitted -> validating -> queued -> initializing -> running -> completing -> completed
//!      \            \           \            \             \            \
//!       +------------+-----------+------------+-------------+------------+--> failed | cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::PipelineSpec;
use crate::{Error, JobId, Result};

/// Execution state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Validating,
    Queued,
    Initializing,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::Submitted,
        JobState::Validating,
        JobState::Queued,
        JobState::Initializing,
        JobState::Running,
        JobState::Completing,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobState::Initializing | JobState::Running | JobState::Completing
        )
    }

    pub fn is_successful(self) -> bool {
        self == JobState::Completed
    }

    /// Whether the executor has been handed the job.
    pub fn has_started_execution(self) -> bool {
        matches!(self, JobState::Running | JobState::Completing)
    }

    /// The next state along the happy path.
    pub fn successor(self) -> Option<JobState> {
        match self {
            JobState::Submitted => Some(JobState::Validating),
            JobState::Validating => Some(JobState::Queued),
            JobState::Queued => Some(JobState::Initializing),
            JobState::Initializing => Some(JobState::Running),
            JobState::Running => Some(JobState::Completing),
            JobState::Completing => Some(JobState::Completed),
            JobState::Completed | JobState::Failed | JobState::Cancelled => None,
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, JobState::Failed | JobState::Cancelled) || self.successor() == Some(next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Validating => "validating",
            JobState::Queued => "queued",
            JobState::Initializing => "initializing",
            JobState::Running => "running",
            JobState::Completing => "completing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job state: {}", s)))
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

/// Format a timestamp the way status and results documents carry it,
/// e.g. `2024-05-01T12:30:00.123456+00:00`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Point-in-time snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    /// Percentage in `0.0..=100.0`; `None` when a job failed before execution started.
    pub progress: Option<f64>,
    pub message: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn is_successful(&self) -> bool {
        self.state.is_successful()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "job_id": self.job_id.to_string(),
            "state": self.state.as_str(),
            "progress": self.progress,
            "message": self.message,
            "created_at": format_timestamp(&self.created_at),
            "updated_at": format_timestamp(&self.updated_at),
        })
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The pipeline spec was rejected after submission.
    Validation,
    /// The executor reported an error.
    ExecutionFailed,
    /// The execution exceeded its wall-clock limit.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Validation => write!(f, "Validation"),
            FailureKind::ExecutionFailed => write!(f, "ExecutionFailed"),
            FailureKind::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Error captured into a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Results of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    job_id: JobId,
    outputs: BTreeMap<String, serde_json::Value>,
    /// Seconds spent inside the executor.
    execution_time: f64,
    logs: Vec<String>,
    metrics: BTreeMap<String, serde_json::Value>,
}

impl JobResults {
    pub fn new(
        job_id: JobId,
        outputs: BTreeMap<String, serde_json::Value>,
        execution_time: Duration,
        logs: Vec<String>,
        metrics: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            job_id,
            outputs,
            execution_time: execution_time.as_secs_f64(),
            logs,
            metrics,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn outputs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&serde_json::Value> {
        self.outputs.get(name)
    }

    pub fn execution_time(&self) -> f64 {
        self.execution_time
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn metrics(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metrics
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "job_id": self.job_id.to_string(),
            "outputs": self.outputs,
            "execution_time": self.execution_time,
            "logs": self.logs,
            "metrics": self.metrics,
        })
    }

    /// Write the results document as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = serde_json::to_string_pretty(&self.to_json())
            .map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(path, body)
            .map_err(|e| Error::Internal(format!("failed to write {}: {}", path.display(), e)))
    }
}

/// Authoritative state of one submitted job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    id: JobId,
    state: JobState,
    progress: Option<f64>,
    message: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    spec: Arc<PipelineSpec>,
    results: Option<Arc<JobResults>>,
    error: Option<JobFailure>,
    logs: Vec<String>,
}

impl JobRecord {
    /// Create a freshly submitted record with a new id.
    pub fn new(spec: Arc<PipelineSpec>) -> Self {
        let now = Utc::now();
        let message = "Job submitted".to_string();
        Self {
            id: JobId::new(),
            state: JobState::Submitted,
            progress: Some(0.0),
            logs: vec![log_line(JobState::Submitted, &message)],
            message,
            created_at: now,
            updated_at: now,
            spec,
            results: None,
            error: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn spec(&self) -> &Arc<PipelineSpec> {
        &self.spec
    }

    pub fn results(&self) -> Option<&Arc<JobResults>> {
        self.results.as_ref()
    }

    pub fn error(&self) -> Option<&JobFailure> {
        self.error.as_ref()
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            state: self.state,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Move one step along the happy path. Progress never goes backwards.
    pub fn advance(
        &mut self,
        next: JobState,
        progress: f64,
        message: impl Into<String>,
    ) -> Result<()> {
        if next.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.check_transition(next)?;
        let progress = progress.clamp(0.0, 100.0);
        self.progress = Some(self.progress.map_or(progress, |current| current.max(progress)));
        self.apply(next, message.into());
        Ok(())
    }

    pub fn complete(&mut self, results: JobResults, message: impl Into<String>) -> Result<()> {
        self.check_transition(JobState::Completed)?;
        self.progress = Some(100.0);
        self.logs.extend(results.logs.iter().cloned());
        self.results = Some(Arc::new(results));
        self.apply(JobState::Completed, message.into());
        Ok(())
    }

    /// Record a failure. Progress keeps its last value, unless execution never
    /// started, in which case it is cleared.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<()> {
        self.check_transition(JobState::Failed)?;
        let message = message.into();
        if !self.state.has_started_execution() {
            self.progress = None;
        }
        self.error = Some(JobFailure {
            kind,
            message: message.clone(),
            timestamp: Utc::now(),
        });
        self.apply(JobState::Failed, message);
        Ok(())
    }

    pub fn cancel(&mut self, message: impl Into<String>) -> Result<()> {
        self.check_transition(JobState::Cancelled)?;
        self.apply(JobState::Cancelled, message.into());
        Ok(())
    }

    fn check_transition(&self, next: JobState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            })
        }
    }

    fn apply(&mut self, next: JobState, message: String) {
        self.state = next;
        self.logs.push(log_line(next, &message));
        self.message = message;
        self.updated_at = Utc::now().max(self.created_at);
    }
}

fn log_line(state: JobState, message: &str) -> String {
    format!("[{}] {}", state, message)
}
