//! `cadence-scheduler`: the in-process job scheduler.
//!
//! A [`Scheduler`] owns named executors and job stores. Its wakeup loop asks
//! every store for due jobs, works out which run times to submit (misfire and
//! coalescing), persists each job's next run time and hands the job to its
//! executor. Executors run the job's registered callable and report the
//! outcome as [`SchedulerEvent`]s.
//!
//! Job bodies are looked up by name in a [`CallableRegistry`], so a job's
//! persisted state never contains code.

pub mod callables;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod jobstore;
pub mod plugins;
pub mod scheduler;

pub use callables::{Callable, CallableRegistry};
pub use error::{ExecutorError, Result, SchedulerError, StoreError, StoreResult};
pub use events::{
    EventKind, EventMask, JobExecution, JobFault, Listener, ListenerId, RunOutcome, SchedulerEvent,
};
pub use executor::{DebugExecutor, Executor, ExecutorContext, ThreadPoolExecutor};
pub use job::{FirstRun, Job, JobChanges, JobSpec};
pub use jobstore::{JobStore, MemoryJobStore, SqliteJobStore};
pub use plugins::PluginRegistry;
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerState};
