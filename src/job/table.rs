//! Process-wide job registry

use super::{Job, JobError, JobId, JobSelector};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

struct TableInner {
    jobs: BTreeMap<JobId, Arc<Job>>,
    next_id: JobId,
}

/// Registry of live jobs, keyed by id in creation order
///
/// The lock is held only to update or copy the list. Callers get `Arc<Job>`
/// handles and operate on jobs without it.
pub struct JobTable {
    inner: Mutex<TableInner>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                jobs: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Reserve the next job id; ids are never reused
    pub fn next_id(&self) -> JobId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    pub fn insert(&self, job: Arc<Job>) {
        self.inner.lock().jobs.insert(job.id, job);
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.lock().jobs.remove(&id)
    }

    /// Resolve a selector. `Id` must match exactly one job; `Tag` and `All`
    /// may match none.
    pub fn select(&self, selector: &JobSelector) -> Result<Vec<Arc<Job>>, JobError> {
        let inner = self.inner.lock();
        match selector {
            JobSelector::Id(id) => inner
                .jobs
                .get(id)
                .map(|job| vec![Arc::clone(job)])
                .ok_or(JobError::NotFound(*id)),
            JobSelector::Tag(tag) => Ok(inner
                .jobs
                .values()
                .filter(|job| job.tag.as_deref() == Some(tag.as_str()))
                .cloned()
                .collect()),
            JobSelector::All => Ok(inner.jobs.values().cloned().collect()),
        }
    }

    /// Copy of the job list
    pub fn snapshot(&self) -> Vec<Arc<Job>> {
        self.inner.lock().jobs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }
}
