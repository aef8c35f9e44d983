//! Caller-facing view of a submitted job.

use crate::manager::Shared;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use qetl_core::job::{JobFailure, JobResults, JobState, JobStatus};
use qetl_core::{Error, JobId, Result};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Handle to a submitted job.
///
/// A handle only holds the job id; every read goes to the manager's store.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    shared: Arc<Shared>,
    results: Arc<OnceLock<Arc<JobResults>>>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

impl JobHandle {
    pub(crate) fn new(id: JobId, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            results: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current status snapshot.
    pub fn status(&self) -> Result<JobStatus> {
        self.shared.store.with(self.id, |r| r.status())
    }

    /// The recorded failure, if the job failed.
    pub fn failure(&self) -> Result<Option<JobFailure>> {
        self.shared.store.with(self.id, |r| r.error().cloned())
    }

    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.status()?.is_terminal())
    }

    pub fn is_successful(&self) -> Result<bool> {
        Ok(self.status()?.is_successful())
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Returns the terminal status whether the job succeeded or not. With a
    /// timeout, gives up with [`Error::Timeout`] and leaves the job running.
    /// A timeout too large to represent as a deadline waits indefinitely.
    pub async fn wait_until_complete(&self, timeout: Option<Duration>) -> Result<JobStatus> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let poll_interval = self.shared.config.poll_interval;
        let mut changes = self.shared.store.subscribe();

        loop {
            let status = self.status()?;
            if status.is_terminal() {
                return Ok(status);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Timeout(format!(
                            "job {} did not complete within {:?}",
                            self.id,
                            timeout.unwrap_or_default()
                        )));
                    }
                    remaining.min(poll_interval)
                }
                None => poll_interval,
            };

            wait_for_change(&mut changes, wait).await;
        }
    }

    /// Wait for the job and return its results.
    pub async fn results(&self) -> Result<Arc<JobResults>> {
        self.results_within(None).await
    }

    /// Like [`JobHandle::results`], giving up after `timeout`.
    ///
    /// A failed job yields `ExecutionFailed` with the recorded message; a
    /// cancelled job yields `ExecutionFailed` saying so.
    pub async fn results_within(&self, timeout: Option<Duration>) -> Result<Arc<JobResults>> {
        if let Some(results) = self.results.get() {
            return Ok(results.clone());
        }

        self.wait_until_complete(timeout).await?;
        let (state, results, failure) = self.shared.store.with(self.id, |r| {
            (r.state(), r.results().cloned(), r.error().cloned())
        })?;

        match state {
            JobState::Completed => {
                let results = results.ok_or_else(|| {
                    Error::Internal(format!("job {} completed without results", self.id))
                })?;
                Ok(self.results.get_or_init(|| results).clone())
            }
            JobState::Cancelled => Err(Error::ExecutionFailed(format!(
                "Job {} was cancelled",
                self.id
            ))),
            _ => Err(Error::ExecutionFailed(
                failure
                    .map(|f| f.message)
                    .unwrap_or_else(|| format!("Job {} failed", self.id)),
            )),
        }
    }

    /// Cancel the job. Returns false when it had already finished.
    ///
    /// A `true` result means CANCELLED is recorded; the executor may take a
    /// moment longer to stop.
    pub fn cancel(&self) -> Result<bool> {
        self.shared.cancel(self.id)
    }

    /// Log lines recorded so far.
    pub fn logs(&self) -> Result<Vec<String>> {
        self.shared.store.with(self.id, |r| r.logs().to_vec())
    }

    /// Stream every recorded log line, live. The stream ends once the job has
    /// finished and all lines were yielded, or when the job is removed while
    /// being followed.
    pub fn follow_logs(&self) -> Result<BoxStream<'static, String>> {
        self.shared.store.with(self.id, |_| ())?;
        let follow = Follow {
            id: self.id,
            shared: self.shared.clone(),
            changes: self.shared.store.subscribe(),
            cursor: 0,
            pending: VecDeque::new(),
            done: false,
        };

        let lines = stream::unfold(follow, |mut follow| async move {
            loop {
                if let Some(line) = follow.pending.pop_front() {
                    return Some((line, follow));
                }
                if follow.done {
                    return None;
                }

                let cursor = follow.cursor;
                let snapshot = follow.shared.store.with(follow.id, |r| {
                    let logs = r.logs();
                    (
                        logs[cursor.min(logs.len())..].to_vec(),
                        r.state().is_terminal(),
                    )
                });
                match snapshot {
                    Ok((lines, terminal)) => {
                        follow.cursor += lines.len();
                        follow.pending.extend(lines);
                        follow.done = terminal;
                    }
                    Err(_) => follow.done = true,
                }

                if follow.pending.is_empty() && !follow.done {
                    let poll_interval = follow.shared.config.poll_interval;
                    wait_for_change(&mut follow.changes, poll_interval).await;
                }
            }
        })
        .boxed();
        Ok(lines)
    }

    /// Call `callback` on every state transition.
    pub fn on_status_change<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&JobStatus) + Send + Sync + 'static,
    {
        self.shared.store.with(self.id, |_| ())?;
        self.shared
            .notifier
            .on_status_change(self.id, Arc::new(callback));
        Ok(())
    }

    /// Call `callback` once when the job finishes, with the results on
    /// success. Fires immediately if the job has already finished.
    pub fn on_completion<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Option<&JobResults>) + Send + 'static,
    {
        let terminal = self.shared.store.with(self.id, |r| {
            r.state().is_terminal().then(|| r.results().cloned())
        })?;
        self.shared
            .notifier
            .on_completion(self.id, Box::new(callback), terminal);
        Ok(())
    }
}

struct Follow {
    id: JobId,
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    cursor: usize,
    pending: VecDeque<String>,
    done: bool,
}

/// Sleep until the store changes or `limit` elapses.
async fn wait_for_change(changes: &mut watch::Receiver<u64>, limit: Duration) {
    match tokio::time::timeout(limit, changes.changed()).await {
        Ok(Ok(())) | Err(_) => {}
        // The store is gone; fall back to plain polling.
        Ok(Err(_)) => tokio::time::sleep(limit).await,
    }
}
