use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::recurrence::Recurrence;
use crate::types::{EngineHandle, JobId};

/// Work invoked at every firing. Runs on the blocking pool.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    owner: JobId,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<EngineHandle, Registration>,
    stopped: bool,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    // Nothing panics while holding the lock; recover rather than cascade.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tokio-based recurrence engine: one timer task per registration, one
/// tracked task per firing.
///
/// Registrations made before [`start`](Self::start) wait for it. After
/// [`stop`](Self::stop) the engine is inert: new registrations are accepted
/// but never fire.
///
/// `schedule` must be called from within a tokio runtime.
pub struct RecurrenceEngine {
    table: Arc<Mutex<Table>>,
    started: watch::Sender<bool>,
    firings: TaskTracker,
}

impl RecurrenceEngine {
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            started,
            firings: TaskTracker::new(),
        }
    }

    pub fn start(&self) {
        if lock(&self.table).stopped {
            warn!("recurrence engine already stopped; start ignored");
            return;
        }
        if !self.started.send_replace(true) {
            info!("recurrence engine started");
        }
    }

    pub fn is_running(&self) -> bool {
        *self.started.borrow() && !lock(&self.table).stopped
    }

    /// True once [`stop`](Self::stop) has begun. A stopped engine never
    /// fires again.
    pub fn is_stopped(&self) -> bool {
        lock(&self.table).stopped
    }

    /// Register `callback` to fire on `rule`. Returns a fresh handle.
    pub fn schedule(&self, owner: JobId, rule: Recurrence, callback: Callback) -> EngineHandle {
        self.schedule_as(EngineHandle::new(), owner, rule, callback)
    }

    /// Register under a caller-supplied handle, replacing any live
    /// registration that already uses it.
    pub fn schedule_as(
        &self,
        handle: EngineHandle,
        owner: JobId,
        rule: Recurrence,
        callback: Callback,
    ) -> EngineHandle {
        let mut table = lock(&self.table);
        if table.stopped {
            warn!(%handle, job_id = owner, "engine stopped; registration will never fire");
            return handle;
        }
        if let Some(previous) = table.entries.remove(&handle) {
            previous.timer.abort();
        }

        debug!(%handle, job_id = owner, rule = %rule, "registration added");
        let timer = tokio::spawn(run_timer(
            handle,
            owner,
            rule,
            callback,
            Arc::clone(&self.table),
            self.started.subscribe(),
            self.firings.clone(),
        ));
        table.entries.insert(handle, Registration { owner, timer });
        handle
    }

    /// Cancel a registration. Unknown handles are a no-op; returns whether
    /// anything was removed. Firings already in flight run to completion.
    pub fn cancel(&self, handle: &EngineHandle) -> bool {
        match lock(&self.table).entries.remove(handle) {
            Some(registration) => {
                registration.timer.abort();
                debug!(%handle, job_id = registration.owner, "registration cancelled");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: &EngineHandle) -> bool {
        lock(&self.table).entries.contains_key(handle)
    }

    /// Owners of all live registrations, sorted.
    pub fn owners(&self) -> Vec<JobId> {
        let mut owners: Vec<JobId> = lock(&self.table)
            .entries
            .values()
            .map(|r| r.owner)
            .collect();
        owners.sort_unstable();
        owners
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every registration and wait for in-flight firings to finish.
    /// No firing starts after this returns.
    pub async fn stop(&self) {
        let cancelled = {
            let mut table = lock(&self.table);
            table.stopped = true;
            let drained: Vec<_> = table.entries.drain().collect();
            for (_, registration) in &drained {
                registration.timer.abort();
            }
            drained.len()
        };
        info!(cancelled, in_flight = self.firings.len(), "recurrence engine stopping");
        self.firings.close();
        self.firings.wait().await;
        info!("recurrence engine stopped");
    }
}

impl Default for RecurrenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecurrenceEngine {
    fn drop(&mut self) {
        for registration in lock(&self.table).entries.values() {
            registration.timer.abort();
        }
    }
}

async fn run_timer(
    handle: EngineHandle,
    owner: JobId,
    rule: Recurrence,
    callback: Callback,
    table: Arc<Mutex<Table>>,
    mut started: watch::Receiver<bool>,
    firings: TaskTracker,
) {
    if started.wait_for(|running| *running).await.is_err() {
        return;
    }

    let mut from = Utc::now();
    loop {
        let now = Utc::now();
        let next = match rule.next_after(from) {
            Some(t) if t >= now => t,
            // Host stalled past a firing: skip the backlog rather than replay it.
            Some(_) => match rule.next_after(now) {
                Some(t) => t,
                None => break,
            },
            None => break,
        };
        if let Ok(delay) = (next - now).to_std() {
            tokio::time::sleep(delay).await;
        }

        {
            let table = lock(&table);
            if table.stopped || !table.entries.contains_key(&handle) {
                return;
            }
            // Spawned under the lock so stop() either sees this firing in
            // the tracker or this timer sees `stopped`.
            let callback = Arc::clone(&callback);
            firings.spawn(async move {
                if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
                    if e.is_panic() {
                        error!(%handle, job_id = owner, "job behavior panicked");
                    }
                }
            });
        }
        debug!(%handle, job_id = owner, at = %next, "fired");
        from = next;
    }
    debug!(%handle, job_id = owner, "schedule exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn every(secs: u64) -> Recurrence {
        Recurrence::every_secs(secs).expect("valid")
    }

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let cb: Callback = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[tokio::test]
    async fn fires_after_start() {
        let engine = RecurrenceEngine::new();
        let (count, cb) = counter();
        engine.schedule(1, every(1), cb);
        engine.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(count.load(Ordering::SeqCst) >= 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn nothing_fires_before_start() {
        let engine = RecurrenceEngine::new();
        let (count, cb) = counter();
        engine.schedule(1, every(1), cb);
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_firing() {
        let engine = RecurrenceEngine::new();
        engine.start();
        let (count, cb) = counter();
        let handle = engine.schedule(1, every(1), cb);
        assert!(engine.contains(&handle));
        assert!(engine.cancel(&handle));
        assert!(!engine.cancel(&handle));
        assert!(!engine.cancel(&EngineHandle::new()));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn schedule_as_replaces_existing_registration() {
        let engine = RecurrenceEngine::new();
        let handle = EngineHandle::new();
        engine.schedule_as(handle, 1, every(60), Arc::new(|| {}));
        engine.schedule_as(handle, 1, every(30), Arc::new(|| {}));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.owners(), vec![1]);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_firing() {
        let engine = RecurrenceEngine::new();
        let finished = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicBool::new(false));
        let (f, e) = (Arc::clone(&finished), Arc::clone(&entered));
        engine.schedule(
            1,
            every(1),
            Arc::new(move || {
                e.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(500));
                f.store(true, Ordering::SeqCst);
            }),
        );
        engine.start();

        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.stop().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn registrations_after_stop_never_fire() {
        let engine = RecurrenceEngine::new();
        engine.start();
        engine.stop().await;
        assert!(engine.is_stopped());
        let (count, cb) = counter();
        let handle = engine.schedule(1, every(1), cb);
        assert!(!engine.contains(&handle));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_callback_is_contained() {
        let engine = RecurrenceEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        engine.schedule(
            1,
            every(1),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                panic!("behavior failure");
            }),
        );
        engine.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        engine.stop().await;
    }
}
