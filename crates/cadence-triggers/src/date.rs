use std::fmt;

use cadence_marshal::{Marshal, Marshaled, Restore, StateMap, StateReader};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::time::{fmt_local, parse_timezone};
use crate::trigger::Trigger;

/// Fires once, at a fixed instant.
#[derive(Debug, Clone, PartialEq)]
pub struct DateTrigger {
    run_date: DateTime<Utc>,
    timezone: Tz,
}

impl DateTrigger {
    pub fn new(run_date: DateTime<Utc>, timezone: Tz) -> Self {
        Self { run_date, timezone }
    }

    pub fn run_date(&self) -> DateTime<Utc> {
        self.run_date
    }
}

impl Trigger for DateTrigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        _now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match previous {
            Some(prev) if prev >= self.run_date => None,
            _ => Some(self.run_date),
        }
    }
}

impl fmt::Display for DateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "date[{}]", fmt_local(self.run_date, &self.timezone))
    }
}

impl Marshal for DateTrigger {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("run_date", self.run_date)
            .with("timezone", self.timezone.name()))
    }
}

impl Restore for DateTrigger {
    const TYPE_REF: &'static str = "cadence.trigger.date";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        let run_date = r.take_timestamp("run_date")?;
        let tz_name = r.take_str("timezone")?;
        let timezone = parse_timezone(&tz_name).map_err(|e| r.invalid(e.to_string()))?;
        Ok(Self { run_date, timezone })
    }
}
