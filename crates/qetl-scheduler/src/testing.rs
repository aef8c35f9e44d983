//! In-memory executor for scheduler tests.

use async_trait::async_trait;
use qetl_core::executor::{ComponentInfo, ExecutionOutput, PipelineExecutor};
use qetl_core::pipeline::PipelineSpec;
use qetl_core::{Error, JobId, PipelineBuilder, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    Fail(String),
    Panic,
}

pub(crate) struct FakeExecutor {
    behavior: Behavior,
    delay: Duration,
    executed: AtomicUsize,
    terminated: Mutex<Vec<JobId>>,
}

impl FakeExecutor {
    pub(crate) fn new(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            delay,
            executed: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn succeeding() -> Arc<Self> {
        Self::new(Behavior::Succeed, Duration::from_millis(10))
    }

    pub(crate) fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> Vec<JobId> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineExecutor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn execute(&self, _job_id: JobId, spec: &PipelineSpec) -> Result<ExecutionOutput> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        match &self.behavior {
            Behavior::Succeed => Ok(ExecutionOutput {
                outputs: spec
                    .outputs
                    .iter()
                    .map(|o| {
                        (
                            o.name.clone(),
                            serde_json::json!({"path": o.path, "format": o.format}),
                        )
                    })
                    .collect(),
                logs: vec![
                    format!("loaded {} input(s)", spec.inputs.len()),
                    "Processing complete".to_string(),
                ],
                metrics: BTreeMap::from([("rows_processed".to_string(), 3.into())]),
            }),
            Behavior::Fail(message) => Err(Error::ExecutionFailed(message.clone())),
            Behavior::Panic => panic!("executor crashed"),
        }
    }

    async fn terminate(&self, job_id: JobId) -> Result<()> {
        self.terminated.lock().unwrap().push(job_id);
        Ok(())
    }

    fn components(&self) -> Vec<ComponentInfo> {
        qetl_config::system::default_components()
    }
}

/// One input, one transformation, one output.
pub(crate) fn simple_pipeline(name: &str) -> PipelineBuilder {
    PipelineSpec::builder(name)
        .input("orders", "data/orders.csv")
        .transformation("wave_encoder")
        .output("report", "out/report.json")
}
