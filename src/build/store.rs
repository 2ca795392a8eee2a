//! Build job storage.
//!
//! The store is the single source of truth for status polling. Status
//! changes go through `update`, which clones the current snapshot, applies
//! the change to the clone and replaces the whole record under the key's
//! lock. Log lines only grow, so `append_logs` extends the record in place
//! under the same lock without copying it. Readers only ever see fully
//! written records.

use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use super::models::BuildJob;

/// Storage seam for build jobs. Swap in a persistent or expiring store
/// without touching orchestration code.
pub trait JobStore: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<BuildJob>;

    fn put(&self, job: BuildJob);

    /// Atomically replace the record for `id` with a modified copy.
    /// Returns the new snapshot, or `None` if the id is unknown.
    fn update(&self, id: &Uuid, f: &mut dyn FnMut(&mut BuildJob)) -> Option<BuildJob>;

    /// Append log lines to a job. Returns `false` if the id is unknown.
    fn append_logs(&self, id: &Uuid, lines: &[String]) -> bool {
        self.update(id, &mut |job| job.logs.extend_from_slice(lines))
            .is_some()
    }

    /// All jobs, newest first.
    fn list(&self) -> Vec<BuildJob>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// Process-lifetime job store. Records are kept until restart.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, BuildJob>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, id: &Uuid) -> Option<BuildJob> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    fn put(&self, job: BuildJob) {
        self.jobs.insert(job.id, job);
    }

    fn update(&self, id: &Uuid, f: &mut dyn FnMut(&mut BuildJob)) -> Option<BuildJob> {
        let mut entry = self.jobs.get_mut(id)?;
        let mut next = entry.value().clone();
        f(&mut next);
        *entry.value_mut() = next.clone();
        Some(next)
    }

    fn append_logs(&self, id: &Uuid, lines: &[String]) -> bool {
        match self.jobs.get_mut(id) {
            Some(mut entry) => {
                entry.value_mut().logs.extend_from_slice(lines);
                true
            }
            None => false,
        }
    }

    fn list(&self) -> Vec<BuildJob> {
        let mut jobs: Vec<BuildJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        jobs
    }
}
