use cadence_core::JobId;
use cadence_marshal::MarshalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Invalid job store configuration: {0}")]
    InvalidConfig(String),

    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Job {job_id} already has {max_instances} running instance(s)")]
    MaxInstancesReached { job_id: JobId, max_instances: u32 },

    #[error("Executor '{0}' has not been started")]
    NotStarted(String),

    #[error("Executor '{0}' is shut down")]
    ShutDown(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Scheduler must be started inside a tokio runtime")]
    NoRuntime,

    #[error("No job by the id of {0} was found")]
    JobLookup(JobId),

    #[error("Job identifier ({0}) conflicts with an existing job")]
    ConflictingId(JobId),

    #[error("No such job store: {0}")]
    UnknownJobStore(String),

    #[error("No such executor: {0}")]
    UnknownExecutor(String),

    #[error("This scheduler already has a job store by the alias of '{0}'")]
    DuplicateJobStore(String),

    #[error("This scheduler already has an executor by the alias of '{0}'")]
    DuplicateExecutor(String),

    #[error("No callable registered under '{0}'")]
    UnknownCallable(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("No {kind} plugin registered under '{name}'")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] cadence_triggers::TriggerError),

    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("Config error: {0}")]
    Config(#[from] cadence_core::CoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
