use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cadence_core::config::{ExhaustedPolicy, JobDefaults, SchedulerConfig, DEFAULT_ALIAS};
use cadence_core::JobId;
use cadence_triggers::time::parse_timezone;
use cadence_triggers::{Trigger, Tz};
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callables::CallableRegistry;
use crate::error::{ExecutorError, Result, SchedulerError, StoreError};
use crate::events::{EventKind, EventMask, Listener, ListenerId, ListenerRegistry, SchedulerEvent};
use crate::executor::{Executor, ExecutorContext, ThreadPoolExecutor};
use crate::job::{FirstRun, Job, JobChanges, JobSpec};
use crate::jobstore::{JobStore, MemoryJobStore};

/// Max workers of the executor added when none is configured.
const DEFAULT_MAX_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Timezone for triggers built from configuration.
    pub timezone: Tz,
    pub job_defaults: JobDefaults,
    /// Delay before polling a job store again after it failed.
    pub jobstore_retry_interval: Duration,
    /// Cap on a single sleep of the wakeup loop.
    pub max_sleep: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            job_defaults: JobDefaults::default(),
            jobstore_retry_interval: Duration::from_secs(10),
            max_sleep: None,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        Ok(Self {
            timezone: parse_timezone(&config.timezone)?,
            job_defaults: config.job_defaults.clone(),
            jobstore_retry_interval: Duration::from_secs(config.jobstore_retry_interval_secs),
            max_sleep: config.max_sleep_secs.map(Duration::from_secs),
        })
    }
}

/// A job added before the scheduler started, committed on start.
struct PendingJob {
    job: Job,
    first_run: FirstRun,
    replace_existing: bool,
}

struct Inner {
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    executors: RwLock<BTreeMap<String, Arc<dyn Executor>>>,
    jobstores: RwLock<BTreeMap<String, Arc<dyn JobStore>>>,
    pending: Mutex<Vec<PendingJob>>,
    /// Held across multi-store job mutations so ids stay unique.
    jobs_lock: Mutex<()>,
    listeners: Arc<ListenerRegistry>,
    callables: CallableRegistry,
    runtime: Mutex<Option<Handle>>,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Decides when jobs are due and hands them to their executors.
///
/// Cheap to clone; every clone drives the same scheduler. Job and component
/// methods may be called from any thread, before or after `start`. Mutations
/// wake the loop so it can recompute its sleep.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, callables: CallableRegistry) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(SchedulerState::Stopped),
                executors: RwLock::new(BTreeMap::new()),
                jobstores: RwLock::new(BTreeMap::new()),
                pending: Mutex::new(Vec::new()),
                jobs_lock: Mutex::new(()),
                listeners: Arc::new(ListenerRegistry::new()),
                callables,
                runtime: Mutex::new(None),
                wakeup: Notify::new(),
                shutdown_tx,
                loop_task: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn callables(&self) -> &CallableRegistry {
        &self.inner.callables
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock().expect("scheduler state poisoned")
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Start the components and spawn the wakeup loop on the current tokio
    /// runtime. Jobs added so far are committed to their stores now.
    ///
    /// With `paused`, nothing is processed until [`resume`](Self::resume).
    pub fn start(&self, paused: bool) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        let mut added = Vec::new();
        {
            let mut state = self.inner.state.lock().expect("scheduler state poisoned");
            if *state != SchedulerState::Stopped {
                return Err(SchedulerError::AlreadyRunning);
            }
            *self.inner.runtime.lock().expect("runtime slot poisoned") = Some(runtime.clone());

            {
                let mut executors = self.inner.executors.write().expect("executors poisoned");
                if !executors.contains_key(DEFAULT_ALIAS) {
                    executors.insert(
                        DEFAULT_ALIAS.to_string(),
                        Arc::new(ThreadPoolExecutor::new(DEFAULT_MAX_WORKERS)),
                    );
                    added.push(SchedulerEvent::Executor {
                        kind: EventKind::ExecutorAdded,
                        alias: DEFAULT_ALIAS.to_string(),
                    });
                }
                for (alias, executor) in executors.iter() {
                    executor.start(self.executor_context(alias, &runtime))?;
                }
            }
            {
                let mut jobstores = self.inner.jobstores.write().expect("jobstores poisoned");
                if !jobstores.contains_key(DEFAULT_ALIAS) {
                    jobstores.insert(DEFAULT_ALIAS.to_string(), Arc::new(MemoryJobStore::new()));
                    added.push(SchedulerEvent::JobStore {
                        kind: EventKind::JobStoreAdded,
                        alias: DEFAULT_ALIAS.to_string(),
                    });
                }
                for (alias, store) in jobstores.iter() {
                    store.start(alias)?;
                }
            }

            *state = if paused {
                SchedulerState::Paused
            } else {
                SchedulerState::Running
            };
        }

        for event in added {
            self.dispatch(event);
        }

        let pending = std::mem::take(&mut *self.inner.pending.lock().expect("pending jobs poisoned"));
        for p in pending {
            let id = p.job.id.clone();
            if let Err(e) = self.real_add_job(p.job, p.first_run, p.replace_existing) {
                error!(job_id = %id, "unable to add pending job: {e}");
            }
        }

        self.inner.shutdown_tx.send_replace(false);
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let task = runtime.spawn(run_loop(self.clone(), shutdown_rx));
        *self.inner.loop_task.lock().expect("loop task poisoned") = Some(task);

        info!(paused, "scheduler started");
        self.dispatch(SchedulerEvent::Scheduler(EventKind::SchedulerStarted));
        self.wakeup();
        Ok(())
    }

    /// Stop the loop, then shut down executors and job stores.
    ///
    /// With `wait`, returns only after every in-flight job has finished.
    /// Running jobs are never cancelled either way.
    pub async fn shutdown(&self, wait: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("scheduler state poisoned");
            if *state == SchedulerState::Stopped {
                return Err(SchedulerError::NotRunning);
            }
            *state = SchedulerState::Stopped;
        }

        self.inner.shutdown_tx.send_replace(true);
        self.inner.wakeup.notify_one();
        let task = self.inner.loop_task.lock().expect("loop task poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("scheduler loop ended abnormally: {e}");
            }
        }

        for executor in self.executors_snapshot().into_values() {
            executor.shutdown(wait).await;
        }
        for store in self.jobstores_snapshot().into_values() {
            store.shutdown();
        }

        info!("scheduler has been shut down");
        self.dispatch(SchedulerEvent::Scheduler(EventKind::SchedulerShutdown));
        Ok(())
    }

    /// Stop processing jobs until [`resume`](Self::resume) is called.
    pub fn pause(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("scheduler state poisoned");
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Paused => return Ok(()),
                SchedulerState::Running => *state = SchedulerState::Paused,
            }
        }
        info!("paused scheduler job processing");
        self.dispatch(SchedulerEvent::Scheduler(EventKind::SchedulerPaused));
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("scheduler state poisoned");
            match *state {
                SchedulerState::Stopped => return Err(SchedulerError::NotRunning),
                SchedulerState::Running => return Ok(()),
                SchedulerState::Paused => *state = SchedulerState::Running,
            }
        }
        info!("resumed scheduler job processing");
        self.dispatch(SchedulerEvent::Scheduler(EventKind::SchedulerResumed));
        self.wakeup();
        Ok(())
    }

    /// Make the loop re-check its job stores now.
    pub fn wakeup(&self) {
        self.inner.wakeup.notify_one();
    }

    // ── components ──────────────────────────────────────────────────────────

    pub fn add_executor(&self, alias: impl Into<String>, executor: Arc<dyn Executor>) -> Result<()> {
        let alias = alias.into();
        {
            let state = self.inner.state.lock().expect("scheduler state poisoned");
            let mut executors = self.inner.executors.write().expect("executors poisoned");
            if executors.contains_key(&alias) {
                return Err(SchedulerError::DuplicateExecutor(alias));
            }
            if *state != SchedulerState::Stopped {
                let runtime = self.runtime()?;
                executor.start(self.executor_context(&alias, &runtime))?;
            }
            executors.insert(alias.clone(), executor);
        }
        self.dispatch(SchedulerEvent::Executor {
            kind: EventKind::ExecutorAdded,
            alias,
        });
        Ok(())
    }

    /// Remove an executor, optionally shutting it down (waiting for its jobs).
    pub async fn remove_executor(&self, alias: &str, shutdown: bool) -> Result<()> {
        let executor = self
            .inner
            .executors
            .write()
            .expect("executors poisoned")
            .remove(alias)
            .ok_or_else(|| SchedulerError::UnknownExecutor(alias.to_string()))?;
        if shutdown {
            executor.shutdown(true).await;
        }
        self.dispatch(SchedulerEvent::Executor {
            kind: EventKind::ExecutorRemoved,
            alias: alias.to_string(),
        });
        Ok(())
    }

    pub fn add_jobstore(&self, alias: impl Into<String>, store: Arc<dyn JobStore>) -> Result<()> {
        let alias = alias.into();
        let running = {
            let state = self.inner.state.lock().expect("scheduler state poisoned");
            let mut jobstores = self.inner.jobstores.write().expect("jobstores poisoned");
            if jobstores.contains_key(&alias) {
                return Err(SchedulerError::DuplicateJobStore(alias));
            }
            if *state != SchedulerState::Stopped {
                store.start(&alias)?;
            }
            jobstores.insert(alias.clone(), store);
            *state != SchedulerState::Stopped
        };
        self.dispatch(SchedulerEvent::JobStore {
            kind: EventKind::JobStoreAdded,
            alias,
        });
        if running {
            self.wakeup();
        }
        Ok(())
    }

    pub fn remove_jobstore(&self, alias: &str, shutdown: bool) -> Result<()> {
        let store = self
            .inner
            .jobstores
            .write()
            .expect("jobstores poisoned")
            .remove(alias)
            .ok_or_else(|| SchedulerError::UnknownJobStore(alias.to_string()))?;
        if shutdown {
            store.shutdown();
        }
        self.dispatch(SchedulerEvent::JobStore {
            kind: EventKind::JobStoreRemoved,
            alias: alias.to_string(),
        });
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>, mask: EventMask) -> ListenerId {
        self.inner.listeners.add(listener, mask)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    // ── jobs ────────────────────────────────────────────────────────────────

    /// Add a job. Before `start` the job is held back and committed (and its
    /// first run time computed) when the scheduler starts.
    pub fn add_job(&self, spec: JobSpec) -> Result<Job> {
        let (job, first_run, replace_existing) = spec.build(&self.inner.settings.job_defaults)?;
        if !self.inner.callables.contains(&job.func) {
            return Err(SchedulerError::UnknownCallable(job.func));
        }

        {
            let state = self.inner.state.lock().expect("scheduler state poisoned");
            if *state == SchedulerState::Stopped {
                let mut pending = self.inner.pending.lock().expect("pending jobs poisoned");
                match pending.iter().position(|p| p.job.id == job.id) {
                    Some(_) if !replace_existing => return Err(SchedulerError::ConflictingId(job.id)),
                    Some(pos) => {
                        pending.remove(pos);
                    }
                    None => {}
                }
                info!(
                    job_id = %job.id,
                    "adding job tentatively; it will be properly scheduled when the scheduler starts"
                );
                pending.push(PendingJob {
                    job: job.clone(),
                    first_run,
                    replace_existing,
                });
                return Ok(job);
            }
        }

        self.real_add_job(job, first_run, replace_existing)
    }

    fn real_add_job(&self, mut job: Job, first_run: FirstRun, replace_existing: bool) -> Result<Job> {
        job.next_run_time = first_run.resolve(job.trigger.as_ref(), Utc::now());
        let store = self.jobstore(&job.jobstore)?;
        {
            let _guard = self.inner.jobs_lock.lock().expect("jobs lock poisoned");
            for (alias, other) in self.jobstores_snapshot() {
                if alias == job.jobstore || other.lookup_job(&job.id)?.is_none() {
                    continue;
                }
                if !replace_existing {
                    return Err(SchedulerError::ConflictingId(job.id));
                }
                other.remove_job(&job.id)?;
            }
            match store.add_job(&job) {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(id)) if !replace_existing => {
                    return Err(SchedulerError::ConflictingId(id));
                }
                Err(StoreError::AlreadyExists(_)) => store.update_job(&job)?,
                Err(e) => return Err(e.into()),
            }
        }

        info!(job_id = %job.id, jobstore = %job.jobstore, "added job \"{}\" to job store", job.name);
        self.dispatch(SchedulerEvent::Job {
            kind: EventKind::JobAdded,
            job_id: job.id.clone(),
            jobstore: job.jobstore.clone(),
        });
        if self.state() == SchedulerState::Running {
            self.wakeup();
        }
        Ok(job)
    }

    /// `Ok(None)` when no job has this id.
    pub fn get_job(&self, id: &JobId, jobstore: Option<&str>) -> Result<Option<Job>> {
        match self.find_job(id, jobstore) {
            Ok((job, _)) => Ok(Some(job)),
            Err(SchedulerError::JobLookup(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Pending jobs first, then each store's jobs in run-time order.
    pub fn get_jobs(&self, jobstore: Option<&str>) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = {
            let pending = self.inner.pending.lock().expect("pending jobs poisoned");
            pending
                .iter()
                .filter(|p| jobstore.map_or(true, |alias| alias == p.job.jobstore))
                .map(|p| p.job.clone())
                .collect()
        };
        for (alias, store) in self.jobstores_snapshot() {
            if jobstore.is_some_and(|wanted| wanted != alias) {
                continue;
            }
            for mut job in store.get_all_jobs()? {
                job.jobstore = alias.clone();
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub fn modify_job(&self, id: &JobId, jobstore: Option<&str>, changes: JobChanges) -> Result<Job> {
        if let Some(func) = &changes.func {
            if !self.inner.callables.contains(func) {
                return Err(SchedulerError::UnknownCallable(func.clone()));
            }
        }
        let job = {
            let _guard = self.inner.jobs_lock.lock().expect("jobs lock poisoned");
            let (mut job, store) = self.find_job(id, jobstore)?;
            let next_run_time = changes.next_run_time;
            changes.apply(&mut job)?;
            match store {
                Some(store) => store.update_job(&job)?,
                None => {
                    let mut pending = self.inner.pending.lock().expect("pending jobs poisoned");
                    if let Some(p) = pending.iter_mut().find(|p| p.job.id == *id) {
                        p.job = job.clone();
                        if let Some(next) = next_run_time {
                            p.first_run = next.map_or(FirstRun::Paused, FirstRun::At);
                        }
                    }
                }
            }
            job
        };

        info!(job_id = %job.id, "modified job \"{}\"", job.name);
        self.dispatch(SchedulerEvent::Job {
            kind: EventKind::JobModified,
            job_id: job.id.clone(),
            jobstore: job.jobstore.clone(),
        });
        if self.state() == SchedulerState::Running {
            self.wakeup();
        }
        Ok(job)
    }

    /// Swap the job's trigger and recompute its next run time from now.
    pub fn reschedule_job(
        &self,
        id: &JobId,
        jobstore: Option<&str>,
        trigger: Arc<dyn Trigger>,
    ) -> Result<Job> {
        let next = trigger.next_fire_time(None, Utc::now());
        self.modify_job(
            id,
            jobstore,
            JobChanges::default().trigger(trigger).next_run_time(next),
        )
    }

    pub fn pause_job(&self, id: &JobId, jobstore: Option<&str>) -> Result<Job> {
        self.modify_job(id, jobstore, JobChanges::default().next_run_time(None))
    }

    /// Recompute the next run time from now. A job whose trigger has nothing
    /// left is removed instead, and `Ok(None)` is returned.
    pub fn resume_job(&self, id: &JobId, jobstore: Option<&str>) -> Result<Option<Job>> {
        let (job, _) = self.find_job(id, jobstore)?;
        match job.trigger.next_fire_time(None, Utc::now()) {
            Some(next) => self
                .modify_job(id, jobstore, JobChanges::default().next_run_time(Some(next)))
                .map(Some),
            None => self.remove_job(id, jobstore).map(|()| None),
        }
    }

    pub fn remove_job(&self, id: &JobId, jobstore: Option<&str>) -> Result<()> {
        let removed_from = {
            let _guard = self.inner.jobs_lock.lock().expect("jobs lock poisoned");
            let from_pending = {
                let mut pending = self.inner.pending.lock().expect("pending jobs poisoned");
                pending
                    .iter()
                    .position(|p| {
                        p.job.id == *id && jobstore.map_or(true, |alias| alias == p.job.jobstore)
                    })
                    .map(|pos| pending.remove(pos).job.jobstore)
            };
            match from_pending {
                Some(alias) => Some(alias),
                None => self.remove_from_stores(id, jobstore)?,
            }
        };

        let alias = removed_from.ok_or_else(|| SchedulerError::JobLookup(id.clone()))?;
        info!(job_id = %id, jobstore = %alias, "removed job");
        self.dispatch(SchedulerEvent::Job {
            kind: EventKind::JobRemoved,
            job_id: id.clone(),
            jobstore: alias,
        });
        Ok(())
    }

    fn remove_from_stores(&self, id: &JobId, jobstore: Option<&str>) -> Result<Option<String>> {
        for (alias, store) in self.jobstores_snapshot() {
            if jobstore.is_some_and(|wanted| wanted != alias) {
                continue;
            }
            match store.remove_job(id) {
                Ok(()) => return Ok(Some(alias)),
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Remove every job, or only those of one store.
    pub fn remove_all_jobs(&self, jobstore: Option<&str>) -> Result<()> {
        let mut cleared = Vec::new();
        {
            let _guard = self.inner.jobs_lock.lock().expect("jobs lock poisoned");
            self.inner
                .pending
                .lock()
                .expect("pending jobs poisoned")
                .retain(|p| jobstore.is_some_and(|alias| alias != p.job.jobstore));
            for (alias, store) in self.jobstores_snapshot() {
                if jobstore.is_some_and(|wanted| wanted != alias) {
                    continue;
                }
                store.remove_all_jobs()?;
                cleared.push(alias);
            }
        }
        for alias in cleared {
            info!(jobstore = %alias, "removed all jobs");
            self.dispatch(SchedulerEvent::JobStore {
                kind: EventKind::AllJobsRemoved,
                alias,
            });
        }
        Ok(())
    }

    // ── wakeup loop ─────────────────────────────────────────────────────────

    /// One wakeup cycle. Returns how long to sleep, or `None` to sleep until
    /// woken.
    fn process_jobs(&self) -> Option<Duration> {
        if self.state() != SchedulerState::Running {
            debug!("scheduler is paused; not processing jobs");
            return None;
        }

        debug!("looking for jobs to run");
        let now = Utc::now();
        let retry_at = now
            + chrono::Duration::from_std(self.inner.settings.jobstore_retry_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let mut next_wakeup: Option<DateTime<Utc>> = None;

        for (alias, store) in self.jobstores_snapshot() {
            let due = match store.get_due_jobs(now) {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(jobstore = %alias, "error getting due jobs from job store: {e}");
                    next_wakeup = earliest(next_wakeup, Some(retry_at));
                    continue;
                }
            };
            for job in due {
                self.process_job(&alias, store.as_ref(), job, now);
            }
            match store.get_next_run_time() {
                Ok(next) => next_wakeup = earliest(next_wakeup, next),
                Err(e) => {
                    error!(jobstore = %alias, "error getting next run time from job store: {e}");
                    next_wakeup = earliest(next_wakeup, Some(retry_at));
                }
            }
        }

        match next_wakeup {
            Some(at) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(next_wakeup = %at, ?wait, "next wakeup scheduled");
                Some(wait)
            }
            None => {
                debug!("no jobs; waiting until a job is added");
                None
            }
        }
    }

    /// Work out the run times of one due job, persist its next run time,
    /// then submit it.
    fn process_job(&self, alias: &str, store: &dyn JobStore, mut job: Job, now: DateTime<Utc>) {
        job.jobstore = alias.to_string();
        let Some(executor) = self.executors_snapshot().remove(&job.executor) else {
            error!(
                job_id = %job.id,
                executor = %job.executor,
                "executor lookup failed for job \"{}\"; removing it from the job store",
                job.name
            );
            if self.remove_job(&job.id, Some(alias)).is_err() {
                debug!(job_id = %job.id, "job was already gone");
            }
            return;
        };

        let mut run_times = job.run_times(now);
        let Some(&last) = run_times.last() else {
            return;
        };
        if job.coalesce && run_times.len() > 1 {
            run_times = vec![last];
        }

        let previous = job.next_run_time;
        job.next_run_time = job.trigger.next_fire_time(Some(last), now);
        let exhausted = job.next_run_time.is_none();
        let remove = exhausted && store.exhausted_policy() == ExhaustedPolicy::Remove;

        // Persist first: if another scheduler already moved this job on, it
        // owns these run times.
        let persisted = if remove {
            store.remove_job(&job.id).map(|()| true)
        } else {
            store.update_job_if(&job, previous)
        };
        match persisted {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "job was updated concurrently; skipping this run");
                return;
            }
            Err(StoreError::NotFound(_)) => {
                debug!(job_id = %job.id, "job was removed concurrently; skipping this run");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, jobstore = %alias, "unable to persist job state; skipping this run: {e}");
                return;
            }
        }

        match executor.submit(&job, run_times.clone()) {
            Ok(()) => self.dispatch(SchedulerEvent::Submission {
                kind: EventKind::JobSubmitted,
                job_id: job.id.clone(),
                jobstore: job.jobstore.clone(),
                run_times,
            }),
            Err(ExecutorError::MaxInstancesReached { max_instances, .. }) => {
                warn!(
                    job_id = %job.id,
                    "execution of job \"{}\" skipped: maximum number of running instances reached ({max_instances})",
                    job.name
                );
                self.dispatch(SchedulerEvent::Submission {
                    kind: EventKind::JobMaxInstances,
                    job_id: job.id.clone(),
                    jobstore: job.jobstore.clone(),
                    run_times,
                });
            }
            Err(e) => {
                error!(job_id = %job.id, executor = %job.executor, "error submitting job: {e}");
            }
        }

        if remove {
            info!(job_id = %job.id, "removed job \"{}\": trigger has no more fire times", job.name);
            self.dispatch(SchedulerEvent::Job {
                kind: EventKind::JobRemoved,
                job_id: job.id,
                jobstore: job.jobstore,
            });
        } else if exhausted {
            info!(job_id = %job.id, "paused job \"{}\": trigger has no more fire times", job.name);
        }
    }

    // ── helpers ─────────────────────────────────────────────────────────────

    fn dispatch(&self, event: SchedulerEvent) {
        self.inner.listeners.dispatch(&event);
    }

    fn runtime(&self) -> Result<Handle> {
        self.inner
            .runtime
            .lock()
            .expect("runtime slot poisoned")
            .clone()
            .ok_or(SchedulerError::NoRuntime)
    }

    fn executor_context(&self, alias: &str, runtime: &Handle) -> ExecutorContext {
        ExecutorContext {
            alias: alias.to_string(),
            callables: self.inner.callables.clone(),
            listeners: self.inner.listeners.clone(),
            runtime: runtime.clone(),
        }
    }

    fn jobstore(&self, alias: &str) -> Result<Arc<dyn JobStore>> {
        self.inner
            .jobstores
            .read()
            .expect("jobstores poisoned")
            .get(alias)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJobStore(alias.to_string()))
    }

    fn jobstores_snapshot(&self) -> BTreeMap<String, Arc<dyn JobStore>> {
        self.inner.jobstores.read().expect("jobstores poisoned").clone()
    }

    fn executors_snapshot(&self) -> BTreeMap<String, Arc<dyn Executor>> {
        self.inner.executors.read().expect("executors poisoned").clone()
    }

    /// Look a job up among pending jobs, then in the stores. `None` as the
    /// store means the job is still pending.
    fn find_job(
        &self,
        id: &JobId,
        jobstore: Option<&str>,
    ) -> Result<(Job, Option<Arc<dyn JobStore>>)> {
        {
            let pending = self.inner.pending.lock().expect("pending jobs poisoned");
            if let Some(p) = pending.iter().find(|p| {
                p.job.id == *id && jobstore.map_or(true, |alias| alias == p.job.jobstore)
            }) {
                return Ok((p.job.clone(), None));
            }
        }
        for (alias, store) in self.jobstores_snapshot() {
            if jobstore.is_some_and(|wanted| wanted != alias) {
                continue;
            }
            if let Some(mut job) = store.lookup_job(id)? {
                job.jobstore = alias;
                return Ok((job, Some(store)));
            }
        }
        Err(SchedulerError::JobLookup(id.clone()))
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending::<()>().await,
    }
}

/// Sleep until the next job is due, a mutation wakes us, or shutdown.
async fn run_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    info!("scheduler loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let wait = match (scheduler.process_jobs(), scheduler.inner.settings.max_sleep) {
            (Some(wait), Some(max)) => Some(wait.min(max)),
            (None, max) => max,
            (wait, None) => wait,
        };
        tokio::select! {
            _ = scheduler.inner.wakeup.notified() => debug!("woken up early"),
            _ = sleep_for(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scheduler loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DebugExecutor;
    use cadence_marshal::StateValue;
    use cadence_triggers::IntervalTrigger;

    fn scheduler() -> Scheduler {
        let callables = CallableRegistry::new();
        callables.register("noop", |_, _| Ok(StateValue::Null));
        let scheduler = Scheduler::new(SchedulerSettings::default(), callables);
        scheduler
            .add_executor(DEFAULT_ALIAS, Arc::new(DebugExecutor::new()))
            .unwrap();
        scheduler
    }

    fn hourly() -> Arc<dyn Trigger> {
        Arc::new(
            IntervalTrigger::new(chrono::Duration::hours(1), Utc::now(), None, Tz::UTC).unwrap(),
        )
    }

    #[test]
    fn earliest_ignores_missing_values() {
        let t = Utc::now();
        assert_eq!(earliest(None, None), None);
        assert_eq!(earliest(Some(t), None), Some(t));
        assert_eq!(earliest(None, Some(t)), Some(t));
        let later = t + chrono::Duration::seconds(1);
        assert_eq!(earliest(Some(later), Some(t)), Some(t));
    }

    #[test]
    fn start_needs_a_runtime() {
        assert!(matches!(scheduler().start(false), Err(SchedulerError::NoRuntime)));
    }

    #[test]
    fn unknown_callables_are_rejected_up_front() {
        let err = scheduler()
            .add_job(JobSpec::new("missing", hourly()))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownCallable(name) if name == "missing"));
    }

    #[test]
    fn pending_jobs_can_be_managed_before_start() {
        let scheduler = scheduler();
        scheduler
            .add_job(JobSpec::new("noop", hourly()).id("a"))
            .unwrap();
        let err = scheduler
            .add_job(JobSpec::new("noop", hourly()).id("a"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ConflictingId(_)));

        let id = JobId::from("a");
        let job = scheduler
            .modify_job(&id, None, JobChanges::default().name("renamed"))
            .unwrap();
        assert_eq!(job.name, "renamed");
        assert_eq!(scheduler.get_jobs(None).unwrap().len(), 1);
        assert!(scheduler.get_job(&id, Some("other")).unwrap().is_none());

        scheduler.remove_job(&id, None).unwrap();
        assert!(scheduler.get_job(&id, None).unwrap().is_none());
        assert!(matches!(
            scheduler.remove_job(&id, None),
            Err(SchedulerError::JobLookup(_))
        ));
    }

    #[test]
    fn lifecycle_calls_need_a_started_scheduler() {
        let scheduler = scheduler();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(scheduler.pause(), Err(SchedulerError::NotRunning)));
        assert!(matches!(scheduler.resume(), Err(SchedulerError::NotRunning)));
    }

    #[test]
    fn duplicate_component_aliases_are_rejected() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.add_executor(DEFAULT_ALIAS, Arc::new(DebugExecutor::new())),
            Err(SchedulerError::DuplicateExecutor(_))
        ));
        scheduler
            .add_jobstore("mem", Arc::new(MemoryJobStore::new()))
            .unwrap();
        assert!(matches!(
            scheduler.add_jobstore("mem", Arc::new(MemoryJobStore::new())),
            Err(SchedulerError::DuplicateJobStore(_))
        ));
        scheduler.remove_jobstore("mem", true).unwrap();
        assert!(matches!(
            scheduler.remove_jobstore("mem", true),
            Err(SchedulerError::UnknownJobStore(_))
        ));
    }

    #[tokio::test]
    async fn start_commits_pending_jobs_and_adds_defaults() {
        let scheduler = scheduler();
        let job = scheduler
            .add_job(JobSpec::new("noop", hourly()).id("a"))
            .unwrap();
        assert!(job.next_run_time.is_none());

        scheduler.start(true).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(matches!(scheduler.start(false), Err(SchedulerError::AlreadyRunning)));

        let committed = scheduler.get_job(&JobId::from("a"), None).unwrap().unwrap();
        assert_eq!(committed.jobstore, DEFAULT_ALIAS);
        assert!(committed.next_run_time.is_some());

        scheduler.resume().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Running);
        scheduler.shutdown(true).await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(
            scheduler.shutdown(true).await,
            Err(SchedulerError::NotRunning)
        ));
    }
}
