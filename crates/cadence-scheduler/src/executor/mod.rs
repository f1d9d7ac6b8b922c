//! Executors run submitted jobs and report one outcome per run time.
//!
//! Every variant shares the same accounting: `submit` refuses a job that
//! already has `max_instances` batches in flight, and a finished batch frees
//! its slot before its events reach the listeners. Variants differ only in
//! where the batch runs.

pub mod debug;
pub mod pool;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use cadence_core::JobId;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::callables::{CallableRegistry, Callable};
use crate::error::ExecutorError;
use crate::events::{JobExecution, JobFault, ListenerRegistry, RunOutcome, SchedulerEvent};
use crate::job::Job;

pub use debug::DebugExecutor;
pub use pool::ThreadPoolExecutor;

/// Handed to an executor when its scheduler starts.
#[derive(Clone)]
pub struct ExecutorContext {
    pub alias: String,
    pub callables: CallableRegistry,
    pub listeners: Arc<ListenerRegistry>,
    pub runtime: tokio::runtime::Handle,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Registered plugin name, e.g. "threadpool".
    fn kind(&self) -> &'static str;

    fn start(&self, ctx: ExecutorContext) -> Result<(), ExecutorError>;

    /// Stop accepting work. With `wait`, resolve only once every in-flight
    /// batch has finished; running job bodies are never cancelled.
    async fn shutdown(&self, wait: bool);

    /// Begin running `job` once per entry of `run_times` and return without
    /// waiting for it.
    ///
    /// The scheduler dispatches `JobSubmitted` after this returns `Ok`, so a
    /// fast job's outcome events may reach listeners first.
    fn submit(&self, job: &Job, run_times: Vec<DateTime<Utc>>) -> Result<(), ExecutorError>;

    /// Number of batches of `job_id` currently in flight.
    fn running_instances(&self, job_id: &JobId) -> u32;
}

/// Per-job count of in-flight batches.
#[derive(Debug, Default)]
pub struct InstanceTracker {
    counts: Mutex<HashMap<JobId, u32>>,
}

impl InstanceTracker {
    /// Check the ceiling and take a slot in one step.
    pub fn try_acquire(&self, job_id: &JobId, max_instances: u32) -> Result<(), ExecutorError> {
        let mut counts = self.counts.lock().expect("instance counts poisoned");
        let count = counts.entry(job_id.clone()).or_insert(0);
        if *count >= max_instances {
            return Err(ExecutorError::MaxInstancesReached {
                job_id: job_id.clone(),
                max_instances,
            });
        }
        *count += 1;
        Ok(())
    }

    pub fn release(&self, job_id: &JobId) {
        let mut counts = self.counts.lock().expect("instance counts poisoned");
        if let Some(count) = counts.get_mut(job_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(job_id);
            }
        }
    }

    pub fn running(&self, job_id: &JobId) -> u32 {
        let counts = self.counts.lock().expect("instance counts poisoned");
        counts.get(job_id).copied().unwrap_or(0)
    }
}

/// State shared by every executor variant.
pub(crate) struct ExecutorCore {
    kind: &'static str,
    ctx: RwLock<Option<ExecutorContext>>,
    instances: InstanceTracker,
    stopped: AtomicBool,
}

impl ExecutorCore {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            ctx: RwLock::new(None),
            instances: InstanceTracker::default(),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn start(&self, ctx: ExecutorContext) {
        info!(executor = %ctx.alias, kind = self.kind, "executor started");
        *self.ctx.write().expect("executor context poisoned") = Some(ctx);
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Take an instance slot for `job` and return the context to run it with.
    pub(crate) fn begin(&self, job: &Job) -> Result<ExecutorContext, ExecutorError> {
        let ctx = self
            .ctx
            .read()
            .expect("executor context poisoned")
            .clone()
            .ok_or_else(|| ExecutorError::NotStarted(self.kind.to_string()))?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown(ctx.alias));
        }
        self.instances.try_acquire(&job.id, job.max_instances)?;
        Ok(ctx)
    }

    /// Free the slot, then hand the outcomes to listeners.
    pub(crate) fn finish(&self, ctx: &ExecutorContext, job_id: &JobId, events: Vec<JobExecution>) {
        self.instances.release(job_id);
        for event in events {
            ctx.listeners.dispatch(&SchedulerEvent::Execution(event));
        }
    }

    pub(crate) fn running(&self, job_id: &JobId) -> u32 {
        self.instances.running(job_id)
    }
}

/// Run one batch: each run time is either missed (later than the grace
/// time allows) or invoked, in order. Never panics on a faulty job body.
pub fn run_job(
    job: &Job,
    callable: Option<&Callable>,
    run_times: &[DateTime<Utc>],
) -> Vec<JobExecution> {
    let mut events = Vec::with_capacity(run_times.len());
    for &run_time in run_times {
        let late = Utc::now() - run_time;
        let missed = late
            .to_std()
            .is_ok_and(|late| late > job.misfire_grace_time);
        let outcome = if missed {
            warn!(
                job_id = %job.id,
                %run_time,
                late_ms = late.num_milliseconds(),
                "run time of job \"{}\" was missed",
                job.name
            );
            RunOutcome::Missed
        } else {
            invoke(job, callable, run_time)
        };
        events.push(JobExecution {
            job_id: job.id.clone(),
            jobstore: job.jobstore.clone(),
            run_time,
            outcome,
        });
    }
    events
}

fn invoke(job: &Job, callable: Option<&Callable>, run_time: DateTime<Utc>) -> RunOutcome {
    let Some(callable) = callable else {
        let fault = JobFault::new(format!("no callable registered under '{}'", job.func));
        error!(job_id = %job.id, %run_time, "{fault}");
        return RunOutcome::Errored(fault);
    };

    info!(job_id = %job.id, %run_time, "running job \"{}\"", job.name);
    match catch_unwind(AssertUnwindSafe(|| callable(&job.args, &job.kwargs))) {
        Ok(Ok(value)) => {
            info!(job_id = %job.id, %run_time, "job \"{}\" executed successfully", job.name);
            RunOutcome::Executed(value)
        }
        Ok(Err(err)) => {
            let fault = JobFault::from_error(&err);
            error!(job_id = %job.id, %run_time, "job \"{}\" raised an error: {fault}", job.name);
            RunOutcome::Errored(fault)
        }
        Err(payload) => {
            let fault = JobFault::from_panic(payload.as_ref());
            error!(job_id = %job.id, %run_time, "job \"{}\" panicked: {fault}", job.name);
            RunOutcome::Errored(fault)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job::JobSpec;
    use cadence_core::config::JobDefaults;
    use cadence_marshal::{StateMap, StateValue};
    use cadence_triggers::{IntervalTrigger, Tz};
    use std::time::Duration;

    pub(crate) fn test_job(id: &str, func: &str) -> Job {
        let trigger = IntervalTrigger::new(chrono::Duration::seconds(1), Utc::now(), None, Tz::UTC)
            .unwrap();
        let (job, _, _) = JobSpec::new(func, Arc::new(trigger))
            .id(id)
            .misfire_grace_time(Duration::from_secs(5))
            .build(&JobDefaults::default())
            .unwrap();
        job
    }

    fn echo(args: &[StateValue], _: &StateMap) -> anyhow::Result<StateValue> {
        Ok(args.first().cloned().unwrap_or(StateValue::Null))
    }

    #[test]
    fn late_run_times_are_missed_within_grace_are_run() {
        let mut job = test_job("grace", "echo");
        job.args = vec![StateValue::from("hi")];
        let now = Utc::now();
        let run_times = [now - chrono::Duration::seconds(10), now - chrono::Duration::seconds(2)];

        let echo: &Callable = &echo;
        let events = run_job(&job, Some(echo), &run_times);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].outcome, RunOutcome::Missed);
        assert_eq!(events[0].run_time, run_times[0]);
        assert_eq!(events[1].outcome, RunOutcome::Executed(StateValue::from("hi")));
    }

    #[test]
    fn faults_and_panics_become_error_outcomes() {
        let job = test_job("faulty", "boom");
        let now = [Utc::now()];

        let failing: &Callable = &|_: &[StateValue], _: &StateMap| -> anyhow::Result<StateValue> {
            anyhow::bail!("exit status 2")
        };
        let events = run_job(&job, Some(failing), &now);
        assert!(
            matches!(&events[0].outcome, RunOutcome::Errored(f) if f.message == "exit status 2")
        );

        let panicking: &Callable = &|_: &[StateValue], _: &StateMap| -> anyhow::Result<StateValue> {
            panic!("index out of range")
        };
        let events = run_job(&job, Some(panicking), &now);
        assert!(
            matches!(&events[0].outcome, RunOutcome::Errored(f) if f.message.contains("index out of range"))
        );

        let events = run_job(&job, None, &now);
        assert!(matches!(events[0].outcome, RunOutcome::Errored(_)));
    }

    #[test]
    fn tracker_enforces_the_ceiling() {
        let tracker = InstanceTracker::default();
        let id = JobId::from("a");
        tracker.try_acquire(&id, 2).unwrap();
        tracker.try_acquire(&id, 2).unwrap();
        assert!(matches!(
            tracker.try_acquire(&id, 2),
            Err(ExecutorError::MaxInstancesReached { max_instances: 2, .. })
        ));
        tracker.release(&id);
        assert_eq!(tracker.running(&id), 1);
        tracker.try_acquire(&id, 2).unwrap();
        tracker.release(&id);
        tracker.release(&id);
        tracker.release(&id);
        assert_eq!(tracker.running(&id), 0);
    }
}
