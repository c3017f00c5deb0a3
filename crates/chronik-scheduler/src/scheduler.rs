use std::sync::Arc;

use tracing::debug;

use crate::codec::DynBehavior;
use crate::engine::{Callback, RecurrenceEngine};
use crate::types::{EngineHandle, JobId, PersistedRecord, RunnableJob};

/// Keeps the engine's live registrations in line with the jobs it is told
/// about. Holds no state of its own: the job→handle link lives on each
/// job's record.
#[derive(Default)]
pub struct Scheduler {
    engine: RecurrenceEngine,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.engine.start();
    }

    /// Blocks until every in-flight firing has finished.
    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.engine.is_stopped()
    }

    /// Register every job with a fresh handle, written back into its record.
    /// Never fails: rules were parsed when the job was built.
    pub fn arm(&self, jobs: &mut [RunnableJob]) {
        for job in jobs.iter_mut() {
            let handle = self
                .engine
                .schedule(job.id(), job.recurrence.clone(), firing_callback(job));
            job.record.engine_handle = Some(handle);
        }
        debug!(count = jobs.len(), "jobs armed");
    }

    /// Register every job under the handle it already carries (fresh handle
    /// if it has none), so a rolled-back job matches its stored handle again.
    pub fn restore(&self, jobs: &mut [RunnableJob]) {
        for job in jobs.iter_mut() {
            let callback = firing_callback(job);
            let rule = job.recurrence.clone();
            let handle = match job.record.engine_handle {
                Some(handle) => self.engine.schedule_as(handle, job.id(), rule, callback),
                None => self.engine.schedule(job.id(), rule, callback),
            };
            job.record.engine_handle = Some(handle);
        }
        debug!(count = jobs.len(), "jobs restored");
    }

    /// Cancel each job's registration. Jobs never armed, or already
    /// disarmed, are skipped silently. Returns how many were live.
    pub fn disarm(&self, jobs: &[RunnableJob]) -> usize {
        self.cancel_all(jobs.iter().map(RunnableJob::handle))
    }

    /// [`disarm`](Self::disarm) for records that were not decoded.
    pub fn disarm_records(&self, records: &[PersistedRecord]) -> usize {
        self.cancel_all(records.iter().map(|r| r.engine_handle))
    }

    pub fn is_armed(&self, handle: &EngineHandle) -> bool {
        self.engine.contains(handle)
    }

    /// Ids of jobs with a live registration, sorted. A job armed twice
    /// appears twice.
    pub fn armed_jobs(&self) -> Vec<JobId> {
        self.engine.owners()
    }

    fn cancel_all(&self, handles: impl Iterator<Item = Option<EngineHandle>>) -> usize {
        let cancelled = handles
            .flatten()
            .filter(|handle| self.engine.cancel(handle))
            .count();
        debug!(cancelled, "jobs disarmed");
        cancelled
    }
}

fn firing_callback(job: &RunnableJob) -> Callback {
    let behavior = Arc::clone(&job.behavior);
    let input = Arc::clone(&job.input);
    Arc::new(move || behavior.run(&input))
}
