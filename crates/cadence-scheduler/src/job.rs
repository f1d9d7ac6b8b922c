use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::{JobDefaults, DEFAULT_ALIAS};
use cadence_core::JobId;
use cadence_marshal::{Marshal, Marshaled, Restore, StateMap, StateReader, StateValue};
use cadence_triggers::{restore_trigger, Trigger};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// A callable bound to a trigger, plus the bookkeeping the scheduler needs
/// to run it.
///
/// Stores own jobs; the scheduler only holds copies while it dispatches.
/// `next_run_time == None` means the job is paused (or its trigger is
/// exhausted and the store keeps it anyway).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Name of a registered callable.
    pub func: String,
    pub args: Vec<StateValue>,
    pub kwargs: StateMap,
    pub trigger: Arc<dyn Trigger>,
    pub executor: String,
    /// Alias of the store holding the job. Not persisted; set on lookup.
    pub jobstore: String,
    pub misfire_grace_time: Duration,
    pub coalesce: bool,
    pub max_instances: u32,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_paused(&self) -> bool {
        self.next_run_time.is_none()
    }

    /// Every run time at or before `now` that has not been processed yet, in
    /// chronological order, starting from `next_run_time`.
    pub fn run_times(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut run_times = Vec::new();
        let mut next = self.next_run_time;
        while let Some(t) = next.filter(|t| *t <= now) {
            run_times.push(t);
            next = self.trigger.next_fire_time(Some(t), now);
            if next.is_some_and(|n| n <= t) {
                warn!(job_id = %self.id, trigger = %self.trigger, "trigger did not advance past {t}");
                break;
            }
        }
        run_times
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.next_run_time {
            Some(t) => write!(
                f,
                "{} (trigger: {}, next run at: {})",
                self.name,
                self.trigger,
                t.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => write!(f, "{} (trigger: {}, paused)", self.name, self.trigger),
        }
    }
}

impl Marshal for Job {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        let grace_us = i64::try_from(self.misfire_grace_time.as_micros()).unwrap_or(i64::MAX);
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("id", self.id.as_str())
            .with("name", self.name.as_str())
            .with("func", self.func.as_str())
            .with("args", self.args.clone())
            .with("kwargs", self.kwargs.clone())
            .with("trigger", self.trigger.marshal()?)
            .with("executor", self.executor.as_str())
            .with("misfire_grace_time_us", grace_us)
            .with("coalesce", self.coalesce)
            .with("max_instances", self.max_instances)
            .with("next_run_time", self.next_run_time))
    }
}

impl Restore for Job {
    const TYPE_REF: &'static str = "cadence.job";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        let id = JobId(r.take_str("id")?);
        let name = r.take_str("name")?;
        let func = r.take_str("func")?;
        let args = r.take_list("args")?;
        let kwargs = r.take_map("kwargs")?;
        let trigger = restore_trigger(r.take_object("trigger")?)?;
        let executor = r.take_str("executor")?;
        let grace_us = r.take_i64("misfire_grace_time_us")?;
        let grace_us = u64::try_from(grace_us)
            .map_err(|_| r.invalid(format!("negative misfire grace time ({grace_us}us)")))?;
        let coalesce = r.take_bool("coalesce")?;
        let max_instances = r.take_u32("max_instances")?;
        if max_instances == 0 {
            return Err(r.invalid("max_instances must be positive"));
        }
        let next_run_time = r.take_opt_timestamp("next_run_time")?;

        Ok(Self {
            id,
            name,
            func,
            args,
            kwargs,
            trigger,
            executor,
            jobstore: String::new(),
            misfire_grace_time: Duration::from_micros(grace_us),
            coalesce,
            max_instances,
            next_run_time,
        })
    }
}

/// How a newly added job gets its first `next_run_time`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FirstRun {
    /// Ask the trigger, as of the moment the job is committed to its store.
    #[default]
    FromTrigger,
    /// Add the job paused.
    Paused,
    At(DateTime<Utc>),
}

impl FirstRun {
    pub fn resolve(self, trigger: &dyn Trigger, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            FirstRun::FromTrigger => trigger.next_fire_time(None, now),
            FirstRun::Paused => None,
            FirstRun::At(t) => Some(t),
        }
    }
}

/// Everything needed to add a job. Unset options fall back to the
/// scheduler's job defaults.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub func: String,
    pub args: Vec<StateValue>,
    pub kwargs: StateMap,
    pub trigger: Arc<dyn Trigger>,
    pub executor: String,
    pub jobstore: String,
    pub misfire_grace_time: Option<Duration>,
    pub coalesce: Option<bool>,
    pub max_instances: Option<u32>,
    pub first_run: FirstRun,
    pub replace_existing: bool,
}

impl JobSpec {
    pub fn new(func: impl Into<String>, trigger: Arc<dyn Trigger>) -> Self {
        Self {
            id: None,
            name: None,
            func: func.into(),
            args: Vec::new(),
            kwargs: StateMap::new(),
            trigger,
            executor: DEFAULT_ALIAS.to_string(),
            jobstore: DEFAULT_ALIAS.to_string(),
            misfire_grace_time: None,
            coalesce: None,
            max_instances: None,
            first_run: FirstRun::FromTrigger,
            replace_existing: false,
        }
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<StateValue>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn executor(mut self, alias: impl Into<String>) -> Self {
        self.executor = alias.into();
        self
    }

    pub fn jobstore(mut self, alias: impl Into<String>) -> Self {
        self.jobstore = alias.into();
        self
    }

    pub fn misfire_grace_time(mut self, grace: Duration) -> Self {
        self.misfire_grace_time = Some(grace);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max: u32) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn paused(mut self) -> Self {
        self.first_run = FirstRun::Paused;
        self
    }

    pub fn first_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_run = FirstRun::At(at);
        self
    }

    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    /// Resolve defaults into a job with no `next_run_time` yet.
    pub(crate) fn build(self, defaults: &JobDefaults) -> Result<(Job, FirstRun, bool)> {
        if self.func.is_empty() {
            return Err(SchedulerError::InvalidJob("func must not be empty".into()));
        }
        let max_instances = self.max_instances.unwrap_or(defaults.max_instances);
        if max_instances == 0 {
            return Err(SchedulerError::InvalidJob(
                "max_instances must be positive".into(),
            ));
        }
        let job = Job {
            id: self.id.unwrap_or_default(),
            name: self.name.unwrap_or_else(|| self.func.clone()),
            func: self.func,
            args: self.args,
            kwargs: self.kwargs,
            trigger: self.trigger,
            executor: self.executor,
            jobstore: self.jobstore,
            misfire_grace_time: self
                .misfire_grace_time
                .unwrap_or(Duration::from_secs(defaults.misfire_grace_time_secs)),
            coalesce: self.coalesce.unwrap_or(defaults.coalesce),
            max_instances,
            next_run_time: None,
        };
        Ok((job, self.first_run, self.replace_existing))
    }
}

/// Partial update for an existing job. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub name: Option<String>,
    pub func: Option<String>,
    pub args: Option<Vec<StateValue>>,
    pub kwargs: Option<StateMap>,
    pub trigger: Option<Arc<dyn Trigger>>,
    pub executor: Option<String>,
    pub misfire_grace_time: Option<Duration>,
    pub coalesce: Option<bool>,
    pub max_instances: Option<u32>,
    pub next_run_time: Option<Option<DateTime<Utc>>>,
}

impl JobChanges {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn func(mut self, func: impl Into<String>) -> Self {
        self.func = Some(func.into());
        self
    }

    pub fn args(mut self, args: Vec<StateValue>) -> Self {
        self.args = Some(args);
        self
    }

    pub fn kwargs(mut self, kwargs: StateMap) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn trigger(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn executor(mut self, alias: impl Into<String>) -> Self {
        self.executor = Some(alias.into());
        self
    }

    pub fn misfire_grace_time(mut self, grace: Duration) -> Self {
        self.misfire_grace_time = Some(grace);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max: u32) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn next_run_time(mut self, next: Option<DateTime<Utc>>) -> Self {
        self.next_run_time = Some(next);
        self
    }

    pub(crate) fn apply(self, job: &mut Job) -> Result<()> {
        if self.max_instances == Some(0) {
            return Err(SchedulerError::InvalidJob(
                "max_instances must be positive".into(),
            ));
        }
        if self.func.as_deref() == Some("") {
            return Err(SchedulerError::InvalidJob("func must not be empty".into()));
        }
        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(func) = self.func {
            job.func = func;
        }
        if let Some(args) = self.args {
            job.args = args;
        }
        if let Some(kwargs) = self.kwargs {
            job.kwargs = kwargs;
        }
        if let Some(trigger) = self.trigger {
            job.trigger = trigger;
        }
        if let Some(executor) = self.executor {
            job.executor = executor;
        }
        if let Some(grace) = self.misfire_grace_time {
            job.misfire_grace_time = grace;
        }
        if let Some(coalesce) = self.coalesce {
            job.coalesce = coalesce;
        }
        if let Some(max) = self.max_instances {
            job.max_instances = max;
        }
        if let Some(next) = self.next_run_time {
            job.next_run_time = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_marshal::{unmarshal_object, MarshalError};
    use cadence_triggers::{DateTrigger, IntervalTrigger, Tz};
    use chrono::TimeZone;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn every_minute() -> Arc<dyn Trigger> {
        Arc::new(
            IntervalTrigger::new(chrono::Duration::minutes(1), anchor(), None, Tz::UTC).unwrap(),
        )
    }

    fn job() -> Job {
        let (mut job, _, _) = JobSpec::new("report", every_minute())
            .id("nightly")
            .args(vec![StateValue::Int(1)])
            .kwarg("to", "ops")
            .build(&JobDefaults::default())
            .unwrap();
        job.next_run_time = Some(anchor());
        job
    }

    #[test]
    fn spec_falls_back_to_defaults() {
        let defaults = JobDefaults {
            misfire_grace_time_secs: 30,
            coalesce: false,
            max_instances: 3,
        };
        let (job, first_run, replace) = JobSpec::new("report", every_minute())
            .build(&defaults)
            .unwrap();
        assert_eq!(job.name, "report");
        assert_eq!(job.executor, DEFAULT_ALIAS);
        assert_eq!(job.misfire_grace_time, Duration::from_secs(30));
        assert!(!job.coalesce);
        assert_eq!(job.max_instances, 3);
        assert_eq!(first_run, FirstRun::FromTrigger);
        assert!(!replace);
        assert!(job.is_paused());
    }

    #[test]
    fn zero_max_instances_is_rejected() {
        let err = JobSpec::new("report", every_minute())
            .max_instances(0)
            .build(&JobDefaults::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));

        let mut job = job();
        let err = JobChanges::default().max_instances(0).apply(&mut job).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));
        assert_eq!(job.max_instances, 1);
    }

    #[test]
    fn run_times_walk_every_overdue_fire_time() {
        let job = job();
        let now = anchor() + chrono::Duration::seconds(150);
        assert_eq!(
            job.run_times(now),
            vec![
                anchor(),
                anchor() + chrono::Duration::minutes(1),
                anchor() + chrono::Duration::minutes(2),
            ]
        );
        assert!(job.run_times(anchor() - chrono::Duration::seconds(1)).is_empty());
    }

    #[test]
    fn run_times_of_a_one_shot_job() {
        let mut job = job();
        job.trigger = Arc::new(DateTrigger::new(anchor(), Tz::UTC));
        assert_eq!(job.run_times(anchor() + chrono::Duration::days(1)), vec![anchor()]);
    }

    #[test]
    fn paused_jobs_have_no_run_times() {
        let mut job = job();
        job.next_run_time = None;
        assert!(job.run_times(anchor() + chrono::Duration::days(1)).is_empty());
    }

    #[test]
    fn marshaled_job_restores_field_by_field() {
        let job = job();
        let marshaled = job.marshal().unwrap();
        let restored: Job = unmarshal_object(marshaled.clone()).unwrap();
        assert_eq!(restored.marshal().unwrap(), marshaled);
        assert_eq!(restored.id, job.id);
        assert_eq!(restored.kwargs["to"], StateValue::from("ops"));
        assert_eq!(restored.next_run_time, Some(anchor()));
        assert!(restored.jobstore.is_empty());
    }

    #[test]
    fn corrupt_grace_time_is_invalid_state() {
        let mut marshaled = job().marshal().unwrap();
        marshaled
            .state
            .insert("misfire_grace_time_us".into(), StateValue::Int(-5));
        let err = unmarshal_object::<Job>(marshaled).unwrap_err();
        assert!(matches!(err, MarshalError::InvalidState { .. }));
    }

    #[test]
    fn changes_only_touch_named_fields() {
        let mut job = job();
        JobChanges::default()
            .coalesce(false)
            .next_run_time(None)
            .apply(&mut job)
            .unwrap();
        assert!(!job.coalesce);
        assert!(job.is_paused());
        assert_eq!(job.func, "report");
    }

    #[test]
    fn display_mentions_trigger_and_next_run() {
        let job = job();
        assert_eq!(
            job.to_string(),
            "report (trigger: interval[0:01:00], next run at: 2024-03-01 12:00:00 UTC)"
        );
    }
}
