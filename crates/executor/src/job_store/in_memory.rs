use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use jobexec_core::{ExclusivityKey, Job, JobId};

use super::query::AcquirableJobsQuery;
use super::r#trait::{JobStats, JobStore, JobStoreError, JobTransaction};

type TxId = u64;

/// In-memory job table with optimistic locking and skip-locked reads.
///
/// Intended for tests/dev and for single-process deployments. Commits are
/// validated against row revisions exactly like a relational store would
/// under optimistic concurrency; skip-locked queries hold row locks until
/// their transaction ends.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    rows: RwLock<HashMap<JobId, Job>>,
    row_locks: Mutex<HashMap<JobId, TxId>>,
    next_tx: AtomicU64,
    next_sequence: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned<T>(_: T) -> JobStoreError {
        JobStoreError::storage("lock poisoned")
    }

    fn release_row_locks(&self, tx: TxId) {
        let mut locks = self.row_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, owner| *owner != tx);
    }

    fn sorted(rows: &HashMap<JobId, Job>, keep: impl Fn(&Job) -> bool, limit: usize) -> Vec<Job> {
        let mut result: Vec<Job> = rows.values().filter(|j| keep(j)).cloned().collect();
        result.sort_by_key(|j| (j.sequence, j.id));
        result.truncate(limit);
        result
    }
}

impl JobStore for InMemoryJobStore {
    fn begin(&self) -> Result<Box<dyn JobTransaction + '_>, JobStoreError> {
        Ok(Box::new(InMemoryJobTransaction {
            store: self,
            id: self.next_tx.fetch_add(1, Ordering::Relaxed) + 1,
            writes: Vec::new(),
            acquisition: None,
            finished: false,
        }))
    }

    fn supports_skip_locked(&self) -> bool {
        true
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        Ok(rows.get(&job_id).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        Ok(Self::sorted(&rows, |_| true, limit))
    }

    fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        Ok(Self::sorted(&rows, Job::is_dead_lettered, limit))
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let rows = self.rows.read().map_err(Self::poisoned)?;
        let mut stats = JobStats {
            total: rows.len(),
            ..Default::default()
        };

        for job in rows.values() {
            if job.is_dead_lettered() {
                stats.dead_lettered += 1;
            } else if job.is_suspended() {
                stats.suspended += 1;
            } else if job.is_locked(now) {
                stats.locked += 1;
            } else if job.is_due(now, true) {
                stats.due += 1;
            }
        }

        Ok(stats)
    }
}

#[derive(Debug)]
enum Write {
    Insert(Job),
    Update(Job),
    Delete(Job),
}

impl Write {
    fn job(&self) -> &Job {
        match self {
            Write::Insert(j) | Write::Update(j) | Write::Delete(j) => j,
        }
    }
}

/// Transaction over an [`InMemoryJobStore`].
#[derive(Debug)]
pub struct InMemoryJobTransaction<'a> {
    store: &'a InMemoryJobStore,
    id: TxId,
    writes: Vec<Write>,
    /// Last acquisition query; its exclusivity rule is re-checked at commit.
    acquisition: Option<AcquirableJobsQuery>,
    finished: bool,
}

impl InMemoryJobTransaction<'_> {
    /// Buffer a write, coalescing with an earlier write to the same row so
    /// the revision check at commit runs once per row.
    fn buffer(&mut self, write: Write) {
        let id = write.job().id;
        match self.writes.iter().position(|w| w.job().id == id) {
            None => self.writes.push(write),
            Some(idx) => {
                let merged = match (&self.writes[idx], write) {
                    (Write::Insert(_), Write::Update(job)) => Some(Write::Insert(job)),
                    (Write::Insert(_), Write::Delete(_)) => None,
                    (_, other) => Some(other),
                };
                match merged {
                    Some(w) => self.writes[idx] = w,
                    None => {
                        self.writes.remove(idx);
                    }
                }
            }
        }
    }

    /// Validate every buffered write against current revisions, then apply all of them.
    fn apply(&mut self) -> Result<(), JobStoreError> {
        let store = self.store;
        let mut rows = store.rows.write().map_err(InMemoryJobStore::poisoned)?;

        for write in &self.writes {
            let job = write.job();
            match (write, rows.get(&job.id)) {
                (Write::Insert(_), Some(_)) => return Err(JobStoreError::AlreadyExists(job.id)),
                (Write::Insert(_), None) => {}
                (_, Some(current)) if current.revision == job.revision => {}
                // Row vanished or moved on since it was read.
                (_, _) => {
                    return Err(JobStoreError::OptimisticLocking {
                        entity: job.kind.type_name(),
                        id: job.id,
                    });
                }
            }
        }
        self.check_exclusive_locks(&rows)?;

        for write in self.writes.drain(..) {
            match write {
                Write::Insert(job) => {
                    rows.insert(job.id, job);
                }
                Write::Update(mut job) => {
                    job.revision += 1;
                    rows.insert(job.id, job);
                }
                Write::Delete(job) => {
                    rows.remove(&job.id);
                }
            }
        }
        Ok(())
    }

    /// Reject newly taken locks on exclusive jobs whose instance another
    /// transaction has locked since this one queried.
    fn check_exclusive_locks(&self, rows: &HashMap<JobId, Job>) -> Result<(), JobStoreError> {
        let Some(query) = &self.acquisition else {
            return Ok(());
        };
        let touched: HashSet<JobId> = self.writes.iter().map(|w| w.job().id).collect();
        let held = query.held_exclusive_keys(rows.values().filter(|job| !touched.contains(&job.id)));

        for write in &self.writes {
            let Write::Update(job) = write else { continue };
            let newly_locked = job.is_locked(query.now)
                && rows.get(&job.id).is_some_and(|current| !current.is_locked(query.now));
            if newly_locked && query.is_blocked_by(job, &held) {
                return Err(JobStoreError::OptimisticLocking {
                    entity: job.kind.type_name(),
                    id: job.id,
                });
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.store.release_row_locks(self.id);
        }
    }
}

impl JobTransaction for InMemoryJobTransaction<'_> {
    fn find_acquirable_jobs(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = self.store.rows.read().map_err(InMemoryJobStore::poisoned)?;
        let mut locks = self.store.row_locks.lock().map_err(InMemoryJobStore::poisoned)?;

        let tx = self.id;
        let selected = query.select(rows.values(), |job| {
            locks.get(&job.id).is_some_and(|owner| *owner != tx)
        });

        // SELECT ... FOR UPDATE SKIP LOCKED holds the returned rows.
        if query.skip_locked {
            for job in &selected {
                locks.insert(job.id, tx);
            }
        }

        self.acquisition = Some(query.clone());
        Ok(selected)
    }

    fn held_exclusive_keys(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<HashSet<ExclusivityKey>, JobStoreError> {
        let rows = self.store.rows.read().map_err(InMemoryJobStore::poisoned)?;
        self.acquisition = Some(query.clone());
        Ok(query.held_exclusive_keys(rows.values()))
    }

    fn load(&mut self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        if let Some(write) = self.writes.iter().find(|w| w.job().id == job_id) {
            return Ok(match write {
                Write::Delete(_) => None,
                Write::Insert(job) | Write::Update(job) => Some(job.clone()),
            });
        }
        self.store.get(job_id)
    }

    fn insert(&mut self, mut job: Job) -> Result<JobId, JobStoreError> {
        if self.store.get(job.id)?.is_some() {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.sequence = self.store.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        job.revision = 1;
        let id = job.id;
        self.buffer(Write::Insert(job));
        Ok(id)
    }

    fn update(&mut self, job: &Job) -> Result<(), JobStoreError> {
        self.buffer(Write::Update(job.clone()));
        Ok(())
    }

    fn delete(&mut self, job: &Job) -> Result<(), JobStoreError> {
        self.buffer(Write::Delete(job.clone()));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), JobStoreError> {
        let result = self.apply();
        self.finish();
        result
    }

    fn rollback(mut self: Box<Self>) {
        self.writes.clear();
        self.finish();
    }
}

impl Drop for InMemoryJobTransaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
