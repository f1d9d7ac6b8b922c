use std::fmt;

use cadence_marshal::{Marshal, Marshaled, Restore, StateMap, StateReader};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::{Result, TriggerError};
use crate::time::{fmt_duration, fmt_local, parse_timezone};
use crate::trigger::Trigger;

/// Fires every `interval`, on the grid `start_date + k * interval`.
///
/// The grid is computed in absolute time, so a daily interval drifts against
/// wall-clock time across a DST transition.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalTrigger {
    interval: Duration,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    timezone: Tz,
}

impl IntervalTrigger {
    pub fn new(
        interval: Duration,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        timezone: Tz,
    ) -> Result<Self> {
        if interval <= Duration::zero() {
            return Err(TriggerError::InvalidConfig(
                "interval must be positive".to_string(),
            ));
        }
        if interval.num_microseconds().is_none() {
            return Err(TriggerError::InvalidConfig(
                "interval is too large".to_string(),
            ));
        }
        Ok(Self {
            interval,
            start_date,
            end_date,
            timezone,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    /// Smallest grid instant `>= t`.
    fn grid_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if t <= self.start_date {
            return Some(self.start_date);
        }
        let elapsed = t.signed_duration_since(self.start_date).num_microseconds()?;
        let period = self.interval.num_microseconds()?;
        let mut k = elapsed / period + i64::from(elapsed % period != 0);
        let mut candidate = self.at_step(k)?;
        // Sub-microsecond remainders are lost by num_microseconds.
        if candidate < t {
            k = k.checked_add(1)?;
            candidate = self.at_step(k)?;
        }
        Some(candidate)
    }

    fn at_step(&self, k: i64) -> Option<DateTime<Utc>> {
        let offset = self.interval.num_microseconds()?.checked_mul(k)?;
        self.start_date
            .checked_add_signed(Duration::microseconds(offset))
    }
}

impl Trigger for IntervalTrigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let next = match previous {
            Some(prev) => {
                self.grid_at_or_after(prev.checked_add_signed(Duration::microseconds(1))?)?
            }
            None => self.grid_at_or_after(now.max(self.start_date))?,
        };
        match self.end_date {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

impl fmt::Display for IntervalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval[{}]", fmt_duration(self.interval))?;
        if let Some(end) = self.end_date {
            write!(f, " until {}", fmt_local(end, &self.timezone))?;
        }
        Ok(())
    }
}

impl Marshal for IntervalTrigger {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        let interval_us = self.interval.num_microseconds().ok_or_else(|| {
            cadence_marshal::MarshalError::InvalidState {
                type_ref: Self::TYPE_REF.to_string(),
                reason: "interval overflows microseconds".to_string(),
            }
        })?;
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("interval_us", interval_us)
            .with("start_date", self.start_date)
            .with("end_date", self.end_date)
            .with("timezone", self.timezone.name()))
    }
}

impl Restore for IntervalTrigger {
    const TYPE_REF: &'static str = "cadence.trigger.interval";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        let interval_us = r.take_i64("interval_us")?;
        if interval_us <= 0 {
            return Err(r.invalid("interval must be positive"));
        }
        let start_date = r.take_timestamp("start_date")?;
        let end_date = r.take_opt_timestamp("end_date")?;
        let tz_name = r.take_str("timezone")?;
        let timezone = parse_timezone(&tz_name).map_err(|e| r.invalid(e.to_string()))?;
        Ok(Self {
            interval: Duration::microseconds(interval_us),
            start_date,
            end_date,
            timezone,
        })
    }
}
