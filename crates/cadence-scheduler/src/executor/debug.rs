use async_trait::async_trait;
use cadence_core::JobId;
use chrono::{DateTime, Utc};

use super::{run_job, Executor, ExecutorContext, ExecutorCore};
use crate::error::ExecutorError;
use crate::job::Job;

/// Runs each batch inline, inside `submit`. Meant for tests and debugging:
/// a slow job stalls the scheduler loop.
///
/// Because the batch has already run when `submit` returns, listeners always
/// receive its `JobExecuted`/`JobError`/`JobMissed` events before the
/// matching `JobSubmitted`.
pub struct DebugExecutor {
    core: ExecutorCore,
}

impl DebugExecutor {
    pub const KIND: &'static str = "debug";

    pub fn new() -> Self {
        Self {
            core: ExecutorCore::new(Self::KIND),
        }
    }
}

impl Default for DebugExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for DebugExecutor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn start(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        self.core.start(ctx);
        Ok(())
    }

    async fn shutdown(&self, _wait: bool) {
        self.core.stop();
    }

    fn submit(&self, job: &Job, run_times: Vec<DateTime<Utc>>) -> Result<(), ExecutorError> {
        let ctx = self.core.begin(job)?;
        let callable = ctx.callables.get(&job.func);
        let events = run_job(job, callable.as_deref(), &run_times);
        self.core.finish(&ctx, &job.id, events);
        Ok(())
    }

    fn running_instances(&self, job_id: &JobId) -> u32 {
        self.core.running(job_id)
    }
}
