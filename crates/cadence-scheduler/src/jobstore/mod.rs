//! Job stores persist jobs and answer "what is due?".

pub mod memory;
pub mod sqlite;

use cadence_core::config::ExhaustedPolicy;
use cadence_core::JobId;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::job::Job;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Persistence backend for jobs.
///
/// Methods are synchronous; backends guard their own state. Ids are unique
/// within a store. Jobs come back with `jobstore` unset; the scheduler fills
/// it in.
pub trait JobStore: Send + Sync {
    /// Registered plugin name, e.g. "memory".
    fn kind(&self) -> &'static str;

    /// Called when the scheduler starts, or when the store is added to a
    /// running scheduler.
    fn start(&self, _alias: &str) -> StoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn lookup_job(&self, id: &JobId) -> StoreResult<Option<Job>>;

    /// Jobs with `next_run_time <= now`, earliest first, ties by id.
    fn get_due_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    /// Earliest `next_run_time` of any job; `None` when empty or all paused.
    fn get_next_run_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    /// All jobs, earliest first, paused jobs last.
    fn get_all_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Fails with `AlreadyExists` if the id is taken.
    fn add_job(&self, job: &Job) -> StoreResult<()>;

    /// Fails with `NotFound` if the id is absent.
    fn update_job(&self, job: &Job) -> StoreResult<()>;

    /// Replace the job only if its stored `next_run_time` still equals
    /// `expected`. Returns `false` when another writer got there first.
    ///
    /// The default is a lookup followed by an update, which is only safe
    /// for stores no other process writes to.
    fn update_job_if(&self, job: &Job, expected: Option<DateTime<Utc>>) -> StoreResult<bool> {
        match self.lookup_job(&job.id)? {
            None => Err(StoreError::NotFound(job.id.clone())),
            Some(current) if current.next_run_time != expected => Ok(false),
            Some(_) => self.update_job(job).map(|()| true),
        }
    }

    /// Fails with `NotFound` if the id is absent.
    fn remove_job(&self, id: &JobId) -> StoreResult<()>;

    fn remove_all_jobs(&self) -> StoreResult<()>;

    /// What the scheduler does with a job whose trigger is exhausted.
    fn exhausted_policy(&self) -> ExhaustedPolicy {
        ExhaustedPolicy::Remove
    }
}
