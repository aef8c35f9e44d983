//! Subprocess executor that runs the external QETL pipeline runner.

use async_trait::async_trait;
use qetl_config::{ExecutorConfig, SystemConfig};
use qetl_core::executor::{ComponentInfo, ExecutionOutput, PipelineExecutor};
use qetl_core::pipeline::PipelineSpec;
use qetl_core::{Error, JobId, Result};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{LazyLock, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

static RESULTS_SAVED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Results saved to\s+(\S.*)$").expect("valid regex"));

type KillSwitches = Mutex<HashMap<JobId, oneshot::Sender<()>>>;

/// Runs each pipeline as `<program> [<entrypoint>] <args> --config - --job-id <id>`
/// with the spec as JSON on stdin.
pub struct ProcessExecutor {
    program: String,
    entrypoint: Option<PathBuf>,
    home: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    components: Vec<ComponentInfo>,
    running: KillSwitches,
}

impl ProcessExecutor {
    /// Create an executor rooted at `home`.
    ///
    /// Fails with a configuration error when `home` or the entrypoint is missing.
    pub fn new(home: impl Into<PathBuf>, config: &ExecutorConfig) -> Result<Self> {
        let home = home.into();
        if !home.is_dir() {
            return Err(Error::Configuration(format!(
                "QETL home directory not found: {}",
                home.display()
            )));
        }

        let entrypoint = match &config.entrypoint {
            Some(entrypoint) => {
                let path = home.join(entrypoint);
                if !path.is_file() {
                    return Err(Error::Configuration(format!(
                        "pipeline runner not found at {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        info!(home = %home.display(), program = %config.program, "process executor initialized");

        Ok(Self {
            program: config.program.clone(),
            entrypoint,
            home,
            args: config.args.clone(),
            env: config.env.clone(),
            components: Vec::new(),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Build from system configuration, detecting the home directory from
    /// the current working directory when none is configured.
    pub fn from_system_config(config: &SystemConfig) -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Configuration(format!("cannot read working directory: {}", e)))?;
        let home = config.detect_home(&cwd).ok_or_else(|| {
            Error::Configuration(
                "QETL installation not found. Set QETL_HOME environment variable.".to_string(),
            )
        })?;
        Ok(Self::new(home, &config.executor)?.with_components(config.components.clone()))
    }

    pub fn with_components(mut self, components: Vec<ComponentInfo>) -> Self {
        self.components = components;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn command_line(&self, job_id: JobId) -> Vec<String> {
        let mut line = vec![self.program.clone()];
        if let Some(entrypoint) = &self.entrypoint {
            line.push(entrypoint.display().to_string());
        }
        line.extend(self.args.iter().cloned());
        line.extend([
            "--config".to_string(),
            "-".to_string(),
            "--job-id".to_string(),
            job_id.to_string(),
        ]);
        line
    }

    fn switches(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, oneshot::Sender<()>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a job's kill switch when its execution ends or is dropped.
struct KillSwitchGuard<'a> {
    running: &'a KillSwitches,
    job_id: JobId,
}

impl Drop for KillSwitchGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

#[async_trait]
impl PipelineExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, job_id: JobId, spec: &PipelineSpec) -> Result<ExecutionOutput> {
        let payload = serde_json::to_vec(spec)
            .map_err(|e| Error::Internal(format!("failed to serialize pipeline: {}", e)))?;
        let command_line = self.command_line(job_id);
        let execution_command = command_line.join(" ");

        let mut child = Command::new(&command_line[0])
            .args(&command_line[1..])
            .current_dir(&self.home)
            .env("QETL_HOME", &self.home)
            .env("PYTHONPATH", &self.home)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExecutionFailed(format!("failed to start {}: {}", self.program, e))
            })?;

        info!(job_id = %job_id, command = %execution_command, "pipeline process started");

        let (kill_tx, kill_rx) = oneshot::channel();
        self.switches().insert(job_id, kill_tx);
        let _guard = KillSwitchGuard {
            running: &self.running,
            job_id,
        };

        let missing = |stream: &str| Error::Internal(format!("child {} was not captured", stream));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let write_spec = async move {
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
            // stdin is dropped here so the runner sees EOF
        };
        let read_stdout = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        };
        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    debug!(job_id = %job_id, "killing pipeline process");
                    match child.kill().await {
                        Ok(()) => child.wait().await,
                        Err(e) => Err(e),
                    }
                }
            }
        };

        let (_, stdout, stderr, status) =
            tokio::try_join!(write_spec, read_stdout, read_stderr, wait).map_err(|e| {
                Error::ExecutionFailed(format!("pipeline process I/O failed: {}", e))
            })?;

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);

        if !status.success() {
            let detail = match stderr.trim() {
                "" => status.to_string(),
                trimmed => trimmed.to_string(),
            };
            warn!(job_id = %job_id, %status, "pipeline process failed");
            return Err(Error::ExecutionFailed(format!(
                "Pipeline execution failed: {}",
                detail
            )));
        }

        debug!(job_id = %job_id, "pipeline process exited successfully");
        Ok(parse_output(
            &stdout,
            status.code().unwrap_or_default(),
            execution_command,
        ))
    }

    async fn terminate(&self, job_id: JobId) -> Result<()> {
        match self.switches().remove(&job_id) {
            Some(kill) => {
                info!(job_id = %job_id, "terminating pipeline process");
                // The receiver is gone if the process already exited.
                let _ = kill.send(());
            }
            None => debug!(job_id = %job_id, "no running process to terminate"),
        }
        Ok(())
    }

    fn components(&self) -> Vec<ComponentInfo> {
        self.components.clone()
    }
}

/// Turn the runner's stdout into an [`ExecutionOutput`].
fn parse_output(stdout: &str, return_code: i32, execution_command: String) -> ExecutionOutput {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut output = match lines.last().and_then(|last| structured_payload(last)) {
        Some(mut output) => {
            if output.logs.is_empty() {
                output.logs = lines[..lines.len() - 1]
                    .iter()
                    .map(|l| l.to_string())
                    .collect();
            }
            output
        }
        None => ExecutionOutput {
            outputs: heuristic_outputs(&lines, stdout),
            logs: lines.iter().map(|l| l.to_string()).collect(),
            metrics: BTreeMap::new(),
        },
    };

    output
        .metrics
        .insert("return_code".to_string(), return_code.into());
    output
        .metrics
        .insert("execution_command".to_string(), execution_command.into());
    output
}

fn structured_payload(line: &str) -> Option<ExecutionOutput> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let object = value.as_object()?;
    let outputs = object.get("outputs")?.as_object()?;

    let metrics = object
        .get("metrics")
        .and_then(|m| m.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let logs = object
        .get("logs")
        .and_then(|l| l.as_array())
        .map(|l| {
            l.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(ExecutionOutput {
        outputs: outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        logs,
        metrics,
    })
}

fn heuristic_outputs(lines: &[&str], stdout: &str) -> BTreeMap<String, serde_json::Value> {
    let mut outputs = BTreeMap::new();
    for line in lines {
        if line.contains("Processing complete") {
            outputs.insert("status".to_string(), "completed".into());
        } else if let Some(caps) = RESULTS_SAVED.captures(line) {
            outputs.insert("result_path".to_string(), caps[1].trim().into());
        }
    }

    if outputs.is_empty() {
        outputs.insert("status".to_string(), "completed".into());
        outputs.insert(
            "message".to_string(),
            "Pipeline execution completed".into(),
        );
        outputs.insert("stdout".to_string(), stdout.into());
    }
    outputs
}
