#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cadence_marshal::StateValue;
use cadence_scheduler::{
    CallableRegistry, DebugExecutor, EventKind, EventMask, Scheduler, SchedulerEvent,
    SchedulerSettings,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

pub fn callables() -> CallableRegistry {
    let callables = CallableRegistry::new();
    callables.register("noop", |_, _| Ok(StateValue::Null));
    callables.register("echo", |args, _| {
        Ok(args.first().cloned().unwrap_or(StateValue::Null))
    });
    callables
}

/// Scheduler whose default executor runs jobs inline on the loop.
pub fn debug_scheduler() -> Scheduler {
    let scheduler = Scheduler::new(SchedulerSettings::default(), callables());
    scheduler
        .add_executor("default", Arc::new(DebugExecutor::new()))
        .unwrap();
    scheduler
}

pub fn events(scheduler: &Scheduler, mask: EventMask) -> UnboundedReceiver<SchedulerEvent> {
    let (tx, rx) = unbounded_channel();
    scheduler.add_listener(
        Arc::new(move |event: &SchedulerEvent| {
            let _ = tx.send(event.clone());
        }),
        mask,
    );
    rx
}

/// Collect events up to and including the first one of `kind`.
pub async fn wait_for(rx: &mut UnboundedReceiver<SchedulerEvent>, kind: EventKind) -> Vec<SchedulerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}; saw {seen:?}"))
            .expect("listener channel closed");
        let done = event.kind() == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn count(events: &[SchedulerEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}
