use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use cadence_core::JobId;
use cadence_marshal::{StateMap, StateValue};
use cadence_scheduler::events::ListenerRegistry;
use cadence_scheduler::{
    CallableRegistry, EventMask, Executor, ExecutorContext, ExecutorError, Job, RunOutcome,
    SchedulerEvent, ThreadPoolExecutor,
};
use cadence_triggers::{IntervalTrigger, Tz};
use chrono::Utc;
use tokio::sync::mpsc::unbounded_channel;

fn job(func: &str, max_instances: u32) -> Job {
    let trigger =
        IntervalTrigger::new(chrono::Duration::minutes(1), Utc::now(), None, Tz::UTC).unwrap();
    Job {
        id: JobId::from("gated"),
        name: func.to_string(),
        func: func.to_string(),
        args: Vec::new(),
        kwargs: StateMap::new(),
        trigger: Arc::new(trigger),
        executor: "default".into(),
        jobstore: "default".into(),
        misfire_grace_time: Duration::from_secs(30),
        coalesce: true,
        max_instances,
        next_run_time: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_instances_turns_away_concurrent_batches() {
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let callables = CallableRegistry::new();
    callables.register("wait", move |_, _| {
        // Blocks until the sender is dropped.
        let _ = gate.lock().unwrap().recv();
        Ok(StateValue::Null)
    });

    let listeners = Arc::new(ListenerRegistry::new());
    let (tx, mut rx) = unbounded_channel();
    listeners.add(
        Arc::new(move |e: &SchedulerEvent| {
            let _ = tx.send(e.clone());
        }),
        EventMask::JOB_EXECUTION,
    );

    let executor = ThreadPoolExecutor::new(4);
    executor
        .start(ExecutorContext {
            alias: "default".into(),
            callables,
            listeners,
            runtime: tokio::runtime::Handle::current(),
        })
        .unwrap();

    let job = job("wait", 1);
    executor.submit(&job, vec![Utc::now()]).unwrap();
    assert_eq!(executor.running_instances(&job.id), 1);
    assert!(matches!(
        executor.submit(&job, vec![Utc::now()]),
        Err(ExecutorError::MaxInstancesReached { max_instances: 1, .. })
    ));

    drop(release);
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("job never finished")
        .unwrap();
    assert!(matches!(
        event,
        SchedulerEvent::Execution(ref exec) if exec.outcome == RunOutcome::Executed(StateValue::Null)
    ));
    assert_eq!(executor.running_instances(&job.id), 0);

    executor.submit(&job, vec![Utc::now()]).unwrap();
    executor.shutdown(true).await;
    assert_eq!(executor.running_instances(&job.id), 0);
    assert!(matches!(
        executor.submit(&job, vec![Utc::now()]),
        Err(ExecutorError::ShutDown(_))
    ));
}

#[tokio::test]
async fn submit_before_start_is_refused() {
    let executor = ThreadPoolExecutor::new(1);
    assert!(matches!(
        executor.submit(&job("noop", 1), vec![Utc::now()]),
        Err(ExecutorError::NotStarted(_))
    ));
}
