use std::sync::Arc;

use chronik_core::config::ChronikConfig;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::codec::Codec;
use crate::error::{Result, SchedulerError};
use crate::repository::{JobRepository, SqliteJobRepository};
use crate::scheduler::Scheduler;
use crate::types::{ids_of, JobDefinition, JobId, JobInfo, PersistedRecord, RunnableJob, ScheduleUpdate};

/// Public entry point. Keeps the durable store and the live scheduler in
/// agreement across every mutation.
///
/// State-reducing operations (delete, pause) write the store first and then
/// disarm. State-adding operations (add, resume, update) arm first and undo
/// the arming if the store write fails. All mutations are serialized by one
/// async lock.
pub struct Controller {
    repository: Arc<dyn JobRepository>,
    codec: Codec,
    scheduler: Scheduler,
    mutation: Mutex<()>,
    fill_on_start: bool,
}

impl Controller {
    pub fn new(repository: Arc<dyn JobRepository>, codec: Codec) -> Self {
        Self {
            repository,
            codec,
            scheduler: Scheduler::new(),
            mutation: Mutex::new(()),
            fill_on_start: true,
        }
    }

    /// Controller over the SQLite store named in `config`.
    pub fn open(config: &ChronikConfig, codec: Codec) -> Result<Self> {
        let repository = SqliteJobRepository::open(&config.database)?;
        Ok(Self::new(Arc::new(repository), codec).with_fill_on_start(config.scheduler.fill_on_start))
    }

    pub fn with_fill_on_start(mut self, fill_on_start: bool) -> Self {
        self.fill_on_start = fill_on_start;
        self
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Start the engine, then re-arm stored jobs (unless disabled in
    /// config). A failed fill is returned but leaves the engine running:
    /// only the rolled-back jobs stay unscheduled, and later operations
    /// arm normally.
    pub async fn start(&self) -> Result<()> {
        self.ensure_live()?;
        self.scheduler.start();
        if self.fill_on_start {
            self.fill().await?;
        }
        Ok(())
    }

    /// Cancel every registration and wait for in-flight firings.
    ///
    /// Final: afterwards `start`, `fill`, `add_jobs`, `resume_jobs` and
    /// `update_schedule` fail with `Stopped`. Delete, pause and the read
    /// operations still reach the store.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Arm every active job in the store and record the live handles.
    /// Safe to call more than once. Returns how many jobs were armed.
    #[instrument(skip(self))]
    pub async fn fill(&self) -> Result<usize> {
        let _guard = self.mutation.lock().await;
        self.ensure_live()?;

        let records = self.repository.load_active().await?;
        let mut jobs = self.decode_all(&records)?;
        let mut previous = self.live_subset(&jobs);
        self.scheduler.disarm(&jobs);
        self.scheduler.arm(&mut jobs);

        if let Err(e) = self.repository.set_handle_and_schedule(&records_of(&jobs)).await {
            let rolled_back = self.scheduler.disarm(&jobs);
            self.scheduler.restore(&mut previous);
            return Err(rollback("fill", rolled_back, e));
        }
        info!(count = jobs.len(), "jobs filled from store");
        Ok(jobs.len())
    }

    /// Create and arm new jobs. Either every job is stored and armed, or
    /// none is.
    #[instrument(skip_all, fields(count = definitions.len()))]
    pub async fn add_jobs(&self, definitions: Vec<JobDefinition>) -> Result<()> {
        if definitions.is_empty() {
            return Ok(());
        }
        let _guard = self.mutation.lock().await;
        self.ensure_live()?;

        let mut jobs = definitions
            .into_iter()
            .map(|def| self.codec.prepare(def))
            .collect::<Result<Vec<_>>>()?;
        self.scheduler.arm(&mut jobs);

        if let Err(e) = self.repository.insert(&records_of(&jobs)).await {
            let rolled_back = self.scheduler.disarm(&jobs);
            return Err(rollback("add_jobs", rolled_back, e));
        }
        info!(ids = ?jobs.iter().map(RunnableJob::id).collect::<Vec<_>>(), "jobs added");
        Ok(())
    }

    /// Remove jobs from the store, then from the scheduler. Fails with
    /// `NotFound` if any id is unknown; nothing changes in that case.
    #[instrument(skip(self))]
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let records = self.repository.load_by_ids(ids).await?;
        self.repository.delete(&ids_of(&records)).await?;
        let disarmed = self.scheduler.disarm_records(&records);
        info!(count = records.len(), disarmed, "jobs deleted");
        Ok(())
    }

    /// Mark jobs paused in the store, then disarm them.
    #[instrument(skip(self))]
    pub async fn pause_jobs(&self, ids: &[JobId]) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let records = self.repository.load_by_ids(ids).await?;
        self.repository.set_paused(&ids_of(&records), true).await?;
        let disarmed = self.scheduler.disarm_records(&records);
        info!(count = records.len(), disarmed, "jobs paused");
        Ok(())
    }

    /// Unpause jobs and arm them again. Jobs that are not paused are left
    /// alone.
    #[instrument(skip(self))]
    pub async fn resume_jobs(&self, ids: &[JobId]) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.ensure_live()?;

        let records = self.repository.load_by_ids(ids).await?;
        let paused: Vec<PersistedRecord> = records.into_iter().filter(|r| r.paused).collect();
        if paused.is_empty() {
            return Ok(());
        }
        let mut jobs = self.decode_all(&paused)?;

        self.repository.set_paused(&ids_of(&paused), false).await?;
        self.scheduler.arm(&mut jobs);

        if let Err(e) = self.repository.set_handle_and_schedule(&records_of(&jobs)).await {
            let rolled_back = self.scheduler.disarm(&jobs);
            return Err(rollback("resume_jobs", rolled_back, e));
        }
        info!(count = jobs.len(), "jobs resumed");
        Ok(())
    }

    /// Move jobs to new recurrences. Every expression is validated before
    /// anything changes; a failed store write puts the old schedule back.
    /// Paused jobs get their new recurrence stored but stay unarmed.
    #[instrument(skip_all, fields(count = updates.len()))]
    pub async fn update_schedule(&self, updates: Vec<ScheduleUpdate>) -> Result<()> {
        let _guard = self.mutation.lock().await;
        self.ensure_live()?;

        let updates = last_update_per_job(updates);
        let ids: Vec<JobId> = updates.iter().map(|u| u.job_id).collect();
        let records = self.repository.load_by_ids(&ids).await?;

        let mut old_jobs = Vec::new();
        let mut new_jobs = Vec::new();
        let mut paused = Vec::new();
        for (update, record) in updates.iter().zip(&records) {
            let old = self.codec.decode(record)?;
            let new = self.codec.reschedule(&old, &update.recurrence)?;
            if record.paused {
                paused.push(new.into_record());
            } else {
                old_jobs.push(old);
                new_jobs.push(new);
            }
        }

        let mut previous = self.live_subset(&old_jobs);
        self.scheduler.disarm(&old_jobs);
        self.scheduler.arm(&mut new_jobs);

        let mut changed = records_of(&new_jobs);
        changed.extend(paused);
        if let Err(e) = self.repository.set_handle_and_schedule(&changed).await {
            let rolled_back = self.scheduler.disarm(&new_jobs);
            self.scheduler.restore(&mut previous);
            return Err(rollback("update_schedule", rolled_back, e));
        }
        info!(count = changed.len(), "schedules updated");
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobInfo> {
        let records = self.repository.load_by_ids(&[id]).await?;
        match records.first() {
            Some(record) => self.codec.describe(record),
            None => Err(SchedulerError::NotFound { ids: vec![id] }),
        }
    }

    /// Every stored job, paused or not, ordered by id.
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        self.repository
            .load_all()
            .await?
            .iter()
            .map(|r| self.codec.describe(r))
            .collect()
    }

    /// Ids of jobs with a live registration in the scheduler, sorted.
    pub fn scheduled_job_ids(&self) -> Vec<JobId> {
        self.scheduler.armed_jobs()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.scheduler.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        Ok(())
    }

    fn decode_all(&self, records: &[PersistedRecord]) -> Result<Vec<RunnableJob>> {
        records.iter().map(|r| self.codec.decode(r)).collect()
    }

    /// Jobs whose current handle is registered with the engine.
    fn live_subset(&self, jobs: &[RunnableJob]) -> Vec<RunnableJob> {
        jobs.iter()
            .filter(|j| j.handle().is_some_and(|h| self.scheduler.is_armed(&h)))
            .cloned()
            .collect()
    }
}

fn records_of(jobs: &[RunnableJob]) -> Vec<PersistedRecord> {
    jobs.iter().map(|j| j.record().clone()).collect()
}

/// Collapse repeated job ids, keeping each id's first position and its last
/// requested recurrence.
fn last_update_per_job(updates: Vec<ScheduleUpdate>) -> Vec<ScheduleUpdate> {
    let mut merged: Vec<ScheduleUpdate> = Vec::with_capacity(updates.len());
    for update in updates {
        match merged.iter_mut().find(|u| u.job_id == update.job_id) {
            Some(existing) => existing.recurrence = update.recurrence,
            None => merged.push(update),
        }
    }
    merged
}

fn rollback(operation: &'static str, rolled_back: usize, source: SchedulerError) -> SchedulerError {
    warn!(operation, rolled_back, error = %source, "store write failed, scheduler rolled back");
    SchedulerError::ConsistencyRollback {
        operation,
        rolled_back,
        source: Box::new(source),
    }
}
