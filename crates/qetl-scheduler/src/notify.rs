//! Status-change and completion callbacks.
//!
//! A single dispatcher task drains the store's transition feed, so callbacks
//! for one job observe transitions in commit order. Subscriber lists are
//! snapshotted before user code runs and no lock is held during a callback.

use crate::store::Transition;
use qetl_core::JobId;
use qetl_core::job::{JobResults, JobStatus};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Invoked once per transition with the new status.
pub type StatusCallback = Arc<dyn Fn(&JobStatus) + Send + Sync>;

/// Invoked once when the job reaches a terminal state.
pub type CompletionCallback = Box<dyn FnOnce(Option<&JobResults>) + Send>;

#[derive(Default)]
struct Subscribers {
    status: Vec<StatusCallback>,
    completion: Vec<CompletionCallback>,
    /// Set once the terminal transition has been dispatched.
    finished: Option<Option<Arc<JobResults>>>,
}

/// Per-job callback registry.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<HashMap<JobId, Subscribers>>,
}

impl Notifier {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Subscribers>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_status_change(&self, id: JobId, callback: StatusCallback) {
        let mut subscribers = self.lock();
        let entry = subscribers.entry(id).or_default();
        // Nothing more will be dispatched for a finished job.
        if entry.finished.is_none() {
            entry.status.push(callback);
        }
    }

    /// Register a completion callback.
    ///
    /// `terminal` carries the outcome when the caller already knows the job is
    /// finished; the callback then runs immediately on the calling thread.
    pub fn on_completion(
        &self,
        id: JobId,
        callback: CompletionCallback,
        terminal: Option<Option<Arc<JobResults>>>,
    ) {
        let mut subscribers = self.lock();
        let entry = subscribers.entry(id).or_default();
        let outcome = match (&entry.finished, terminal) {
            (Some(finished), _) => finished.clone(),
            (None, Some(outcome)) => outcome,
            (None, None) => {
                entry.completion.push(callback);
                return;
            }
        };
        drop(subscribers);
        invoke_completion(id, callback, outcome.as_deref());
    }

    /// Drop all subscriptions for a removed job.
    pub fn forget(&self, id: JobId) {
        self.lock().remove(&id);
    }

    /// Deliver one transition to its subscribers.
    pub fn dispatch(&self, transition: &Transition) {
        let id = transition.status.job_id;
        let terminal = transition.status.is_terminal();

        let (status_callbacks, completion_callbacks) = {
            let mut subscribers = self.lock();
            let entry = if terminal {
                // Remember the outcome so late completion callbacks still fire.
                subscribers.entry(id).or_default()
            } else {
                match subscribers.get_mut(&id) {
                    Some(entry) => entry,
                    None => return,
                }
            };
            if entry.finished.is_some() {
                return;
            }
            if terminal {
                entry.finished = Some(transition.results.clone());
                (
                    std::mem::take(&mut entry.status),
                    std::mem::take(&mut entry.completion),
                )
            } else {
                (entry.status.clone(), Vec::new())
            }
        };

        debug!(
            job_id = %id,
            state = %transition.status.state,
            subscribers = status_callbacks.len() + completion_callbacks.len(),
            "dispatching transition"
        );

        for callback in &status_callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&transition.status))).is_err() {
                warn!(job_id = %id, "status callback panicked");
            }
        }
        for callback in completion_callbacks {
            invoke_completion(id, callback, transition.results.as_deref());
        }
    }

    /// Drain transitions until every sender is gone.
    pub async fn run(self: Arc<Self>, mut transitions: mpsc::UnboundedReceiver<Transition>) {
        while let Some(transition) = transitions.recv().await {
            self.dispatch(&transition);
        }
        debug!("notification dispatcher stopped");
    }
}

fn invoke_completion(id: JobId, callback: CompletionCallback, results: Option<&JobResults>) {
    if catch_unwind(AssertUnwindSafe(|| callback(results))).is_err() {
        warn!(job_id = %id, "completion callback panicked");
    }
}
