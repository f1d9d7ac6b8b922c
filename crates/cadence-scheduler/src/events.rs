use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use cadence_core::JobId;
use cadence_marshal::StateValue;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

/// Every kind of event the scheduler and its executors emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SchedulerStarted,
    SchedulerShutdown,
    SchedulerPaused,
    SchedulerResumed,
    ExecutorAdded,
    ExecutorRemoved,
    JobStoreAdded,
    JobStoreRemoved,
    AllJobsRemoved,
    JobAdded,
    JobRemoved,
    JobModified,
    JobExecuted,
    JobError,
    JobMissed,
    JobSubmitted,
    JobMaxInstances,
}

impl EventKind {
    const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// Set of event kinds a listener wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask(u32::MAX);
    /// Outcomes reported by executors.
    pub const JOB_EXECUTION: EventMask = EventMask(
        EventKind::JobExecuted.bit() | EventKind::JobError.bit() | EventKind::JobMissed.bit(),
    );

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl From<EventKind> for EventMask {
    fn from(kind: EventKind) -> Self {
        EventMask(kind.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<EventKind> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        self | EventMask::from(rhs)
    }
}

impl BitOr for EventKind {
    type Output = EventMask;

    fn bitor(self, rhs: EventKind) -> EventMask {
        EventMask::from(self) | rhs
    }
}

/// A fault raised by a job body: the top-level message plus its cause chain.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFault {
    pub message: String,
    pub causes: Vec<String>,
}

impl JobFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            causes: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }

    /// Describe a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("job panicked: {detail}"))
    }
}

impl fmt::Display for JobFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// What happened to one run time of a submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Missed,
    Executed(StateValue),
    Errored(JobFault),
}

impl RunOutcome {
    pub fn kind(&self) -> EventKind {
        match self {
            RunOutcome::Missed => EventKind::JobMissed,
            RunOutcome::Executed(_) => EventKind::JobExecuted,
            RunOutcome::Errored(_) => EventKind::JobError,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobExecution {
    pub job_id: JobId,
    pub jobstore: String,
    pub run_time: DateTime<Utc>,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Started, shut down, paused or resumed.
    Scheduler(EventKind),
    Executor {
        kind: EventKind,
        alias: String,
    },
    /// Store added or removed, or all of its jobs removed.
    JobStore {
        kind: EventKind,
        alias: String,
    },
    /// Job added, removed or modified.
    Job {
        kind: EventKind,
        job_id: JobId,
        jobstore: String,
    },
    /// Submitted to an executor, or turned away at its instance ceiling.
    Submission {
        kind: EventKind,
        job_id: JobId,
        jobstore: String,
        run_times: Vec<DateTime<Utc>>,
    },
    Execution(JobExecution),
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Scheduler(kind) => *kind,
            SchedulerEvent::Executor { kind, .. }
            | SchedulerEvent::JobStore { kind, .. }
            | SchedulerEvent::Job { kind, .. }
            | SchedulerEvent::Submission { kind, .. } => *kind,
            SchedulerEvent::Execution(e) => e.outcome.kind(),
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            SchedulerEvent::Job { job_id, .. } | SchedulerEvent::Submission { job_id, .. } => {
                Some(job_id)
            }
            SchedulerEvent::Execution(e) => Some(&e.job_id),
            _ => None,
        }
    }
}

/// Receives scheduler events. Any `Fn(&SchedulerEvent)` closure qualifies.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

impl<F> Listener for F
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SchedulerEvent) {
        self(event)
    }
}

/// Handle returned by [`ListenerRegistry::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    mask: EventMask,
    listener: Arc<dyn Listener>,
}

/// Fans events out to listeners whose mask matches.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn Listener>, mask: EventMask) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.push(Registration { id, mask, listener });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Deliver `event` to every matching listener, in registration order.
    ///
    /// A panicking listener is logged and skipped.
    pub fn dispatch(&self, event: &SchedulerEvent) {
        let kind = event.kind();
        // Snapshot so listeners may add or remove listeners themselves.
        let matching: Vec<Arc<dyn Listener>> = {
            let listeners = self.listeners.read().expect("listener registry poisoned");
            listeners
                .iter()
                .filter(|r| r.mask.contains(kind))
                .map(|r| r.listener.clone())
                .collect()
        };
        debug!(?kind, listeners = matching.len(), "dispatching event");
        for listener in matching {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                let fault = JobFault::from_panic(payload.as_ref());
                error!(?kind, "error notifying listener: {fault}");
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("ListenerRegistry")
            .field("listeners", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn executed(id: &str) -> SchedulerEvent {
        SchedulerEvent::Execution(JobExecution {
            job_id: JobId::from(id),
            jobstore: "default".into(),
            run_time: Utc::now(),
            outcome: RunOutcome::Executed(StateValue::Null),
        })
    }

    #[test]
    fn masks_combine_and_match() {
        let mask = EventKind::JobAdded | EventKind::JobRemoved;
        assert!(mask.contains(EventKind::JobAdded));
        assert!(!mask.contains(EventKind::JobModified));
        assert!(EventMask::ALL.contains(EventKind::JobMaxInstances));
        assert!(!EventMask::NONE.contains(EventKind::SchedulerStarted));
        assert!(EventMask::JOB_EXECUTION.contains(EventKind::JobMissed));
        assert!(!EventMask::JOB_EXECUTION.contains(EventKind::JobSubmitted));
    }

    #[test]
    fn listeners_only_see_their_kinds() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.add(
            Arc::new(move |e: &SchedulerEvent| sink.lock().unwrap().push(e.kind())),
            EventMask::JOB_EXECUTION,
        );

        registry.dispatch(&SchedulerEvent::Scheduler(EventKind::SchedulerStarted));
        registry.dispatch(&executed("a"));

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::JobExecuted]);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        registry.add(
            Arc::new(|_: &SchedulerEvent| panic!("listener bug")),
            EventMask::ALL,
        );
        let counter = hits.clone();
        registry.add(
            Arc::new(move |_: &SchedulerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            EventMask::ALL,
        );

        registry.dispatch(&executed("a"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_silent() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let id = registry.add(
            Arc::new(move |_: &SchedulerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            EventMask::ALL,
        );
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.dispatch(&executed("a"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fault_carries_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("writing report");
        let fault = JobFault::from_error(&err);
        assert_eq!(fault.message, "writing report");
        assert_eq!(fault.causes, vec!["disk full".to_string()]);
        assert_eq!(fault.to_string(), "writing report: disk full");
    }
}
