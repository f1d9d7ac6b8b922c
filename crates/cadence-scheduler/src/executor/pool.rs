use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::JobId;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::{run_job, Executor, ExecutorContext, ExecutorCore};
use crate::error::ExecutorError;
use crate::job::Job;

/// Runs batches on tokio's blocking thread pool, at most `max_workers` at a time.
pub struct ThreadPoolExecutor {
    core: Arc<ExecutorCore>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    tracker: TaskTracker,
}

impl ThreadPoolExecutor {
    pub const KIND: &'static str = "threadpool";

    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            core: Arc::new(ExecutorCore::new(Self::KIND)),
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            tracker: TaskTracker::new(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn start(&self, ctx: ExecutorContext) -> Result<(), ExecutorError> {
        self.tracker.reopen();
        self.core.start(ctx);
        Ok(())
    }

    async fn shutdown(&self, wait: bool) {
        self.core.stop();
        self.tracker.close();
        if wait {
            info!(in_flight = self.tracker.len(), "waiting for running jobs to finish");
            self.tracker.wait().await;
        }
    }

    fn submit(&self, job: &Job, run_times: Vec<DateTime<Utc>>) -> Result<(), ExecutorError> {
        let ctx = self.core.begin(job)?;
        let core = self.core.clone();
        let workers = self.workers.clone();
        let runtime = ctx.runtime.clone();
        let job = job.clone();

        self.tracker.spawn_on(
            async move {
                // Held until the batch is done.
                let _permit = workers.acquire_owned().await.ok();
                let callable = ctx.callables.get(&job.func);
                let job_id = job.id.clone();
                let events = match tokio::task::spawn_blocking(move || {
                    run_job(&job, callable.as_deref(), &run_times)
                })
                .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        error!(job_id = %job_id, "job worker failed: {e}");
                        Vec::new()
                    }
                };
                debug!(job_id = %job_id, events = events.len(), "batch finished");
                core.finish(&ctx, &job_id, events);
            },
            &runtime,
        );
        Ok(())
    }

    fn running_instances(&self, job_id: &JobId) -> u32 {
        self.core.running(job_id)
    }
}
