//! In-memory job store.
//!
//! The store exclusively owns every [`JobRecord`]. All mutation goes through
//! [`JobStore::update`], which applies a mutator to a copy and commits it only
//! when the mutator succeeds.

use qetl_core::job::{JobRecord, JobResults, JobState, JobStatus};
use qetl_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, watch};

/// A committed state change, published in commit order.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: JobStatus,
    /// Present when the transition is to COMPLETED.
    pub results: Option<Arc<JobResults>>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<JobId, JobRecord>,
    /// Insertion order, for stable listings.
    order: Vec<JobId>,
}

/// Concurrency-safe mapping from job id to record.
pub struct JobStore {
    inner: RwLock<StoreInner>,
    revision: watch::Sender<u64>,
    transitions: mpsc::UnboundedSender<Transition>,
}

impl JobStore {
    /// Create an empty store and the receiving end of its transition feed.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (transitions, rx) = mpsc::unbounded_channel();
        let (revision, _) = watch::channel(0);
        let store = Self {
            inner: RwLock::new(StoreInner::default()),
            revision,
            transitions,
        };
        (store, rx)
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Insert a new record. Fails with `Conflict` if the id is taken.
    pub fn put(&self, record: JobRecord) -> Result<()> {
        let mut inner = self.write();
        let id = record.id();
        if inner.records.contains_key(&id) {
            return Err(Error::Conflict(format!("job {} already exists", id)));
        }
        inner.order.push(id);
        inner.records.insert(id, record);
        drop(inner);
        self.bump();
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<JobRecord> {
        self.read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::job_not_found(id))
    }

    /// Read a projection of a record without cloning all of it.
    pub fn with<T>(&self, id: JobId, f: impl FnOnce(&JobRecord) -> T) -> Result<T> {
        self.read()
            .records
            .get(&id)
            .map(f)
            .ok_or_else(|| Error::job_not_found(id))
    }

    /// Atomically read-modify-write one record.
    ///
    /// The mutator runs on a copy; on error the stored record is untouched and
    /// the error is returned. State changes are published before the write
    /// lock is released.
    pub fn update<F>(&self, id: JobId, mutate: F) -> Result<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> Result<()>,
    {
        let mut inner = self.write();
        let current = inner
            .records
            .get(&id)
            .ok_or_else(|| Error::job_not_found(id))?;

        let mut next = current.clone();
        mutate(&mut next)?;

        if next.state() != current.state() {
            // The receiver only goes away with the manager.
            let _ = self.transitions.send(Transition {
                status: next.status(),
                results: next.results().cloned(),
            });
        }
        inner.records.insert(id, next.clone());
        drop(inner);
        self.bump();
        Ok(next)
    }

    /// Records in insertion order, optionally filtered by state, capped at `limit`.
    pub fn list(&self, state: Option<JobState>, limit: usize) -> Vec<JobRecord> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id))
            .filter(|record| state.is_none_or(|s| record.state() == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: JobId) -> Result<JobRecord> {
        let mut inner = self.write();
        let record = inner
            .records
            .remove(&id)
            .ok_or_else(|| Error::job_not_found(id))?;
        inner.order.retain(|existing| *existing != id);
        drop(inner);
        self.bump();
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs not yet in a terminal state.
    pub fn count_active(&self) -> usize {
        self.read()
            .records
            .values()
            .filter(|record| !record.state().is_terminal())
            .count()
    }

    /// Subscribe to store changes. The value is a revision counter bumped on
    /// every committed write.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qetl_core::job::FailureKind;
    use qetl_core::pipeline::PipelineSpec;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn make_record() -> JobRecord {
        let spec = PipelineSpec::builder("store-test")
            .input("a", "a.csv")
            .transformation("wave_encoder")
            .build()
            .unwrap();
        JobRecord::new(Arc::new(spec))
    }

    #[test]
    fn test_put_get_remove() {
        let (store, _rx) = JobStore::new();
        let record = make_record();
        let id = record.id();

        store.put(record.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(id).unwrap().state(), JobState::Submitted);

        assert!(matches!(store.put(record), Err(Error::Conflict(_))));

        store.remove(id).unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.get(id), Err(Error::NotFound(_))));
        assert!(matches!(store.remove(id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_failed_mutation_leaves_record_untouched() {
        let (store, _rx) = JobStore::new();
        let record = make_record();
        let id = record.id();
        store.put(record).unwrap();

        // Skipping ahead is rejected, and the partial edit is discarded.
        let result = store.update(id, |r| {
            r.advance(JobState::Validating, 10.0, "Validating configuration")?;
            r.advance(JobState::Running, 40.0, "Executing pipeline")
        });
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));

        let stored = store.get(id).unwrap();
        assert_eq!(stored.state(), JobState::Submitted);
        assert_eq!(stored.progress(), Some(0.0));
        assert_eq!(stored.logs().len(), 1);
    }

    #[test]
    fn test_update_unknown_job() {
        let (store, _rx) = JobStore::new();
        let result = store.update(JobId::new(), |_| Ok(()));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_keeps_insertion_order_and_limit() {
        let (store, _rx) = JobStore::new();
        let ids: Vec<JobId> = (0..5)
            .map(|_| {
                let record = make_record();
                let id = record.id();
                store.put(record).unwrap();
                id
            })
            .collect();

        let listed: Vec<JobId> = store.list(None, 2).iter().map(|r| r.id()).collect();
        assert_eq!(listed, ids[..2]);

        store
            .update(ids[3], |r| r.cancel("Job cancelled by user"))
            .unwrap();
        let cancelled = store.list(Some(JobState::Cancelled), 10);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id(), ids[3]);
        assert_eq!(store.count_active(), 4);

        store.remove(ids[0]).unwrap();
        let listed: Vec<JobId> = store.list(None, 10).iter().map(|r| r.id()).collect();
        assert_eq!(listed, ids[1..]);
    }

    #[test]
    fn test_transitions_published_in_commit_order() {
        let (store, mut rx) = JobStore::new();
        let record = make_record();
        let id = record.id();
        store.put(record).unwrap();

        store
            .update(id, |r| r.advance(JobState::Validating, 10.0, "Validating configuration"))
            .unwrap();
        // Same state, no transition.
        store.update(id, |_| Ok(())).unwrap();
        store
            .update(id, |r| r.fail(FailureKind::Validation, "bad spec"))
            .unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status.state, JobState::Validating);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.status.state, JobState::Failed);
        assert!(second.results.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_completion_transition_carries_results() {
        let (store, mut rx) = JobStore::new();
        let record = make_record();
        let id = record.id();
        store.put(record).unwrap();

        for (state, progress) in [
            (JobState::Validating, 10.0),
            (JobState::Queued, 20.0),
            (JobState::Initializing, 30.0),
            (JobState::Running, 40.0),
            (JobState::Completing, 90.0),
        ] {
            store
                .update(id, |r| r.advance(state, progress, "step"))
                .unwrap();
        }
        let results = JobResults::new(
            id,
            BTreeMap::new(),
            Duration::from_millis(5),
            vec![],
            BTreeMap::new(),
        );
        store
            .update(id, |r| r.complete(results, "Job completed successfully"))
            .unwrap();

        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(last.status.state, JobState::Completed);
        assert_eq!(last.results.unwrap().job_id(), id);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_commit() {
        let (store, _rx) = JobStore::new();
        let mut changes = store.subscribe();
        let record = make_record();
        store.put(record).unwrap();

        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let (store, _rx) = JobStore::new();
        let store = Arc::new(store);
        let record = make_record();
        let id = record.id();
        store.put(record).unwrap();

        // Only one thread can win the race to cancel.
        let winners: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.update(id, |r| r.cancel("race")).is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();
        assert_eq!(winners, 1);
        assert_eq!(store.get(id).unwrap().state(), JobState::Cancelled);
    }
}
