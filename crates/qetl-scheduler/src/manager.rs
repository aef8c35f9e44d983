//! Job manager: the entry point for submitting and tracking jobs.

use crate::handle::JobHandle;
use crate::notify::Notifier;
use crate::runner::JobRunner;
use crate::store::JobStore;
use qetl_config::SystemConfig;
use qetl_core::executor::{ComponentInfo, PipelineExecutor};
use qetl_core::job::{JobRecord, JobState};
use qetl_core::pipeline::PipelineSpec;
use qetl_core::{Error, JobId, Result};
use qetl_executor::ExecutorAdapter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Manager tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Executor time limit for pipelines that do not set their own.
    pub execution_timeout: Duration,
    /// Upper bound on how long a waiter sleeps between status checks.
    pub poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&SystemConfig> for ManagerConfig {
    fn from(config: &SystemConfig) -> Self {
        Self {
            execution_timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Outcome of [`Manager::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub message: String,
    pub pipeline_name: Option<String>,
}

/// Summary returned by [`Manager::instance_info`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub mode: &'static str,
    pub executor: &'static str,
    pub version: &'static str,
    pub active_jobs: usize,
    pub total_jobs: usize,
}

/// State shared by the manager, its handles and its runners.
pub(crate) struct Shared {
    pub(crate) store: JobStore,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) adapter: ExecutorAdapter,
    pub(crate) config: ManagerConfig,
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
}

impl Shared {
    fn tokens(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_token(&self, id: JobId) {
        self.tokens().remove(&id);
    }

    /// Record the cancellation, then signal the runner.
    pub(crate) fn cancel(&self, id: JobId) -> Result<bool> {
        match self.store.update(id, |r| r.cancel("Job cancelled by user")) {
            Ok(_) => {
                if let Some(token) = self.tokens().get(&id) {
                    token.cancel();
                }
                info!(job_id = %id, "job cancelled by user");
                Ok(true)
            }
            Err(Error::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Local, in-process job manager.
///
/// Cloning is cheap; clones share the same jobs.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    /// Create a manager on top of `executor`.
    ///
    /// Must be called within a Tokio runtime: the notification dispatcher is
    /// spawned here.
    pub fn new(executor: Arc<dyn PipelineExecutor>, config: ManagerConfig) -> Self {
        let (store, transitions) = JobStore::new();
        let notifier = Arc::new(Notifier::default());
        tokio::spawn(notifier.clone().run(transitions));

        info!(executor = executor.name(), "job manager started");

        Self {
            shared: Arc::new(Shared {
                store,
                notifier,
                adapter: ExecutorAdapter::new(executor),
                config,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate and start a pipeline. Returns as soon as the job is recorded;
    /// execution proceeds in the background.
    pub fn submit(&self, spec: PipelineSpec) -> Result<JobHandle> {
        spec.validate_structure()?;

        let spec = Arc::new(spec);
        let record = JobRecord::new(spec.clone());
        let id = record.id();
        self.shared.store.put(record)?;

        let token = CancellationToken::new();
        self.shared.tokens().insert(id, token.clone());
        info!(job_id = %id, pipeline = %spec.name, "job submitted");

        JobRunner::new(self.shared.clone(), id, spec, token).spawn();
        Ok(JobHandle::new(id, self.shared.clone()))
    }

    pub fn get(&self, id: JobId) -> Result<JobHandle> {
        self.shared.store.with(id, |_| ())?;
        Ok(JobHandle::new(id, self.shared.clone()))
    }

    /// Handles in submission order, optionally filtered by state.
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobHandle> {
        self.shared
            .store
            .list(state, limit)
            .iter()
            .map(|record| JobHandle::new(record.id(), self.shared.clone()))
            .collect()
    }

    /// Cancel a job. Returns false when it had already finished.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        self.shared.cancel(id)
    }

    /// Forget a finished job.
    pub fn remove(&self, id: JobId) -> Result<()> {
        let state = self.shared.store.with(id, |r| r.state())?;
        if !state.is_terminal() {
            return Err(Error::Conflict(format!("job {} is still {}", id, state)));
        }
        self.shared.store.remove(id)?;
        self.shared.notifier.forget(id);
        info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Check a pipeline without submitting it.
    pub fn validate(&self, spec: &PipelineSpec) -> ValidationReport {
        let pipeline_name = (!spec.name.is_empty()).then(|| spec.name.clone());
        match spec.validate_structure() {
            Ok(()) => ValidationReport {
                valid: true,
                message: "Configuration is valid".to_string(),
                pipeline_name,
            },
            Err(Error::Validation(message)) => ValidationReport {
                valid: false,
                message,
                pipeline_name,
            },
            Err(e) => ValidationReport {
                valid: false,
                message: e.to_string(),
                pipeline_name,
            },
        }
    }

    pub fn components(&self) -> Vec<ComponentInfo> {
        self.shared.adapter.executor().components()
    }

    pub fn instance_info(&self) -> InstanceInfo {
        InstanceInfo {
            mode: "local",
            executor: self.shared.adapter.executor().name(),
            version: env!("CARGO_PKG_VERSION"),
            active_jobs: self.shared.store.count_active(),
            total_jobs: self.shared.store.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, FakeExecutor, simple_pipeline};
    use qetl_core::job::FailureKind;

    fn manager(executor: Arc<FakeExecutor>) -> Manager {
        Manager::new(executor, ManagerConfig::default())
    }

    #[tokio::test]
    async fn test_simple_pipeline_completes() {
        let executor = FakeExecutor::succeeding();
        let manager = manager(executor.clone());

        let job = manager
            .submit(simple_pipeline("orders").build().unwrap())
            .unwrap();
        let status = job.wait_until_complete(None).await.unwrap();

        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, Some(100.0));
        assert_eq!(status.message, "Job completed successfully");

        let results = job.results().await.unwrap();
        assert_eq!(results.outputs().len(), 1);
        assert_eq!(results.output("report").unwrap()["path"], "out/report.json");
        assert_eq!(results.metrics()["rows_processed"], 3);
        assert_eq!(executor.executed(), 1);

        let logs = job.logs().unwrap();
        assert_eq!(logs.first().unwrap(), "[submitted] Job submitted");
        assert!(logs.contains(&"Processing complete".to_string()));
        assert_eq!(logs.last().unwrap(), "[completed] Job completed successfully");
    }

    #[tokio::test]
    async fn test_missing_transformations_rejected_at_submit() {
        let manager = manager(FakeExecutor::succeeding());
        let mut spec = simple_pipeline("broken").build().unwrap();
        spec.transformations.clear();

        let err = manager.submit(spec).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("transformations")));
        assert!(manager.list(None, 10).is_empty());
        assert_eq!(manager.instance_info().total_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_timeout_fails_job() {
        let executor = FakeExecutor::new(Behavior::Succeed, Duration::from_secs(10));
        let manager = manager(executor.clone());
        let spec = simple_pipeline("slow")
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        let job = manager.submit(spec).unwrap();
        let status = job.wait_until_complete(None).await.unwrap();

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.progress, Some(40.0));
        let failure = job.failure().unwrap().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(executor.terminated(), vec![job.id()]);
        assert!(matches!(job.results().await, Err(Error::ExecutionFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let executor = FakeExecutor::new(Behavior::Succeed, Duration::from_secs(10));
        let manager = Manager::new(
            executor,
            ManagerConfig {
                execution_timeout: Duration::from_secs(3),
                ..ManagerConfig::default()
            },
        );

        let job = manager
            .submit(simple_pipeline("slow").build().unwrap())
            .unwrap();
        job.wait_until_complete(None).await.unwrap();
        assert_eq!(job.failure().unwrap().unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_job() {
        let executor = FakeExecutor::new(Behavior::Succeed, Duration::from_secs(5));
        let manager = manager(executor.clone());

        let job = manager
            .submit(simple_pipeline("long").build().unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(manager.cancel(job.id()).unwrap());
        let status = job.wait_until_complete(None).await.unwrap();
        assert_eq!(status.state, JobState::Cancelled);

        match job.results().await {
            Err(Error::ExecutionFailed(msg)) => assert!(msg.contains("cancelled")),
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }

        // Let the runner observe the token and clean up.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executor.terminated(), vec![job.id()]);
        assert!(!manager.cancel(job.id()).unwrap());
        assert_eq!(
            manager.get(job.id()).unwrap().status().unwrap().state,
            JobState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_before_runner_starts() {
        let executor = FakeExecutor::succeeding();
        let manager = manager(executor.clone());

        let job = manager
            .submit(simple_pipeline("early").build().unwrap())
            .unwrap();
        assert!(job.cancel().unwrap());

        let status = job.wait_until_complete(None).await.unwrap();
        assert_eq!(status.state, JobState::Cancelled);
        tokio::task::yield_now().await;
        assert_eq!(executor.executed(), 0);
    }

    #[tokio::test]
    async fn test_list_in_submission_order() {
        let manager = manager(FakeExecutor::succeeding());
        let ids: Vec<JobId> = (1..=5)
            .map(|i| {
                manager
                    .submit(simple_pipeline(&format!("job-{}", i)).build().unwrap())
                    .unwrap()
                    .id()
            })
            .collect();

        let listed: Vec<JobId> = manager.list(None, 2).iter().map(|h| h.id()).collect();
        assert_eq!(listed, ids[..2]);

        for handle in manager.list(None, 10) {
            handle.wait_until_complete(None).await.unwrap();
        }
        assert_eq!(manager.list(Some(JobState::Completed), 10).len(), 5);
        assert!(manager.list(Some(JobState::Failed), 10).is_empty());
    }

    #[tokio::test]
    async fn test_executor_failure_is_recorded() {
        let executor = FakeExecutor::new(
            Behavior::Fail("input file missing".to_string()),
            Duration::from_millis(5),
        );
        let manager = manager(executor);

        let job = manager
            .submit(simple_pipeline("failing").build().unwrap())
            .unwrap();
        let status = job.wait_until_complete(None).await.unwrap();

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.progress, Some(40.0));
        let failure = job.failure().unwrap().unwrap();
        assert_eq!(failure.kind, FailureKind::ExecutionFailed);
        assert_eq!(failure.message, "input file missing");
        match job.results().await {
            Err(Error::ExecutionFailed(msg)) => assert_eq!(msg, "input file missing"),
            other => panic!("Expected ExecutionFailed, got {:?}", other),
        }
        assert!(job.logs().unwrap().contains(&"[failed] input file missing".to_string()));
    }

    #[tokio::test]
    async fn test_executor_panic_fails_job() {
        let manager = manager(FakeExecutor::new(Behavior::Panic, Duration::ZERO));

        let job = manager
            .submit(simple_pipeline("crashing").build().unwrap())
            .unwrap();
        let status = job.wait_until_complete(None).await.unwrap();

        assert_eq!(status.state, JobState::Failed);
        assert!(status.message.contains("executor crashed"));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let manager = manager(FakeExecutor::succeeding());
        let id = JobId::new();
        assert!(matches!(manager.get(id), Err(Error::NotFound(_))));
        assert!(matches!(manager.cancel(id), Err(Error::NotFound(_))));
        assert!(matches!(manager.remove(id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_only_finished_jobs() {
        let manager = manager(FakeExecutor::new(Behavior::Succeed, Duration::from_millis(20)));
        let job = manager
            .submit(simple_pipeline("removable").build().unwrap())
            .unwrap();

        assert!(matches!(manager.remove(job.id()), Err(Error::Conflict(_))));

        job.wait_until_complete(None).await.unwrap();
        manager.remove(job.id()).unwrap();
        assert!(matches!(manager.get(job.id()), Err(Error::NotFound(_))));
        assert!(matches!(job.status(), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_instance_info_counts_jobs() {
        let manager = manager(FakeExecutor::new(Behavior::Succeed, Duration::from_millis(50)));
        let first = manager
            .submit(simple_pipeline("a").build().unwrap())
            .unwrap();
        manager
            .submit(simple_pipeline("b").build().unwrap())
            .unwrap();

        let info = manager.instance_info();
        assert_eq!(info.mode, "local");
        assert_eq!(info.executor, "fake");
        assert_eq!(info.total_jobs, 2);
        assert_eq!(info.active_jobs, 2);

        first.wait_until_complete(None).await.unwrap();
        assert!(manager.instance_info().active_jobs < 2);
    }

    #[tokio::test]
    async fn test_validate_report() {
        let manager = manager(FakeExecutor::succeeding());

        let report = manager.validate(&simple_pipeline("ok").build().unwrap());
        assert!(report.valid);
        assert_eq!(report.pipeline_name.as_deref(), Some("ok"));

        let mut spec = simple_pipeline("broken").build().unwrap();
        spec.inputs.clear();
        let report = manager.validate(&spec);
        assert!(!report.valid);
        assert!(report.message.contains("input_sources"));
        assert_eq!(manager.instance_info().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_components_come_from_executor() {
        let manager = manager(FakeExecutor::succeeding());
        let names: Vec<String> = manager.components().into_iter().map(|c| c.name).collect();
        assert!(names.contains(&"holographic_grover".to_string()));
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_config_from_system_config() {
        let mut system = SystemConfig::default();
        system.timeout_secs = 42;
        system.poll_interval_ms = 250;
        let config = ManagerConfig::from(&system);
        assert_eq!(config.execution_timeout, Duration::from_secs(42));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }
}
