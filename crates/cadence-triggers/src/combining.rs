use std::fmt;
use std::sync::Arc;

use cadence_marshal::{Marshal, Marshaled, Restore, StateMap, StateReader, StateValue};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::restore::restore_trigger;
use crate::trigger::Trigger;

/// Upper bound on probe rounds before an AND trigger gives up.
pub const MAX_AND_ROUNDS: usize = 10_000;

/// Fires when every sub-trigger agrees on the next fire time, within
/// `tolerance`.
#[derive(Debug, Clone)]
pub struct AndTrigger {
    triggers: Vec<Arc<dyn Trigger>>,
    tolerance: Duration,
}

impl AndTrigger {
    pub fn new(triggers: Vec<Arc<dyn Trigger>>) -> Self {
        Self::with_tolerance(triggers, Duration::zero())
    }

    pub fn with_tolerance(triggers: Vec<Arc<dyn Trigger>>, tolerance: Duration) -> Self {
        Self {
            triggers,
            tolerance: tolerance.max(Duration::zero()),
        }
    }

    pub fn triggers(&self) -> &[Arc<dyn Trigger>] {
        &self.triggers
    }

    fn candidates(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Vec<DateTime<Utc>>> {
        if self.triggers.is_empty() {
            return None;
        }
        self.triggers
            .iter()
            .map(|t| t.next_fire_time(previous, now))
            .collect()
    }
}

impl Trigger for AndTrigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut candidates = self.candidates(previous, now)?;
        for _ in 0..MAX_AND_ROUNDS {
            let earliest = *candidates.iter().min()?;
            let latest = *candidates.iter().max()?;
            if latest - earliest <= self.tolerance {
                return Some(latest);
            }
            // Ask every sub-trigger again, starting right at the latest one.
            let probe = latest - Duration::microseconds(1);
            candidates = self.candidates(Some(probe), latest)?;
        }
        warn!(
            trigger = %self,
            rounds = MAX_AND_ROUNDS,
            "sub-triggers never coincided; treating trigger as exhausted"
        );
        None
    }
}

/// Fires at the earliest next fire time of any sub-trigger.
#[derive(Debug, Clone)]
pub struct OrTrigger {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl OrTrigger {
    pub fn new(triggers: Vec<Arc<dyn Trigger>>) -> Self {
        Self { triggers }
    }

    pub fn triggers(&self) -> &[Arc<dyn Trigger>] {
        &self.triggers
    }
}

impl Trigger for OrTrigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.triggers
            .iter()
            .filter_map(|t| t.next_fire_time(previous, now))
            .min()
    }
}

fn fmt_children(f: &mut fmt::Formatter<'_>, name: &str, triggers: &[Arc<dyn Trigger>]) -> fmt::Result {
    write!(f, "{name}[")?;
    for (i, t) in triggers.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{t}")?;
    }
    f.write_str("]")
}

impl fmt::Display for AndTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_children(f, "and", &self.triggers)
    }
}

impl fmt::Display for OrTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_children(f, "or", &self.triggers)
    }
}

fn marshal_children(triggers: &[Arc<dyn Trigger>]) -> cadence_marshal::Result<StateValue> {
    let children = triggers
        .iter()
        .map(|t| t.marshal().map(StateValue::Object))
        .collect::<cadence_marshal::Result<Vec<_>>>()?;
    Ok(StateValue::List(children))
}

fn restore_children(r: &mut StateReader) -> cadence_marshal::Result<Vec<Arc<dyn Trigger>>> {
    let items = r.take_list("triggers")?;
    items
        .into_iter()
        .map(|item| match item {
            StateValue::Object(m) => restore_trigger(m),
            other => Err(r.invalid(format!("sub-trigger is a {}", other.kind()))),
        })
        .collect()
}

impl Marshal for AndTrigger {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        let tolerance_us = self.tolerance.num_microseconds().unwrap_or(i64::MAX);
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("triggers", marshal_children(&self.triggers)?)
            .with("tolerance_us", tolerance_us))
    }
}

impl Restore for AndTrigger {
    const TYPE_REF: &'static str = "cadence.trigger.and";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        let triggers = restore_children(&mut r)?;
        let tolerance = Duration::microseconds(r.take_i64("tolerance_us")?);
        Ok(Self::with_tolerance(triggers, tolerance))
    }
}

impl Marshal for OrTrigger {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("triggers", marshal_children(&self.triggers)?))
    }
}

impl Restore for OrTrigger {
    const TYPE_REF: &'static str = "cadence.trigger.or";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        Ok(Self::new(restore_children(&mut r)?))
    }
}
