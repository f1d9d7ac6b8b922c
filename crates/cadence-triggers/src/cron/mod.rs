//! Calendar-field triggers.
//!
//! Matching runs on wall-clock time in the trigger's timezone. Fields are
//! visited from coarsest (`year`) to finest (`second`); when a field has no
//! acceptable value left, the next coarser field is advanced and every finer
//! field resets to its minimum.

mod expressions;
mod fields;

use std::collections::BTreeMap;
use std::fmt;

use cadence_marshal::{Marshal, Marshaled, Restore, StateMap, StateReader, StateValue};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

pub use expressions::{Expression, Position};
pub use fields::{days_in_month, CronField, FieldKind};

use crate::error::{Result, TriggerError};
use crate::time::{ceil_to_second, fmt_local, parse_timezone, shift_out_of_gap};
use crate::trigger::Trigger;

/// Field expressions as configured. Unset fields are filled in by
/// [`CronTrigger::new`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CronSpec {
    #[serde(default, deserialize_with = "text_or_number")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub month: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub day: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub week: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub day_of_week: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub hour: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub minute: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub second: Option<String>,
}

impl CronSpec {
    /// Split a five-field crontab line (`m h dom mon dow`).
    ///
    /// Weekday numbers follow this crate's convention (0 = Monday); names
    /// such as `sun` are usually clearer.
    pub fn from_crontab(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day, month, day_of_week] = parts.as_slice() else {
            return Err(TriggerError::InvalidConfig(format!(
                "wrong number of fields in crontab expression '{expr}': got {}, expected 5",
                parts.len()
            )));
        };
        Ok(Self {
            minute: Some(minute.to_string()),
            hour: Some(hour.to_string()),
            day: Some(day.to_string()),
            month: Some(month.to_string()),
            day_of_week: Some(day_of_week.to_string()),
            ..Self::default()
        })
    }

    fn get(&self, kind: FieldKind) -> Option<&str> {
        match kind {
            FieldKind::Year => self.year.as_deref(),
            FieldKind::Month => self.month.as_deref(),
            FieldKind::Day => self.day.as_deref(),
            FieldKind::Week => self.week.as_deref(),
            FieldKind::DayOfWeek => self.day_of_week.as_deref(),
            FieldKind::Hour => self.hour.as_deref(),
            FieldKind::Minute => self.minute.as_deref(),
            FieldKind::Second => self.second.as_deref(),
        }
    }
}

fn text_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

/// Fires on instants whose calendar fields all match.
#[derive(Debug, Clone, PartialEq)]
pub struct CronTrigger {
    fields: Vec<CronField>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    timezone: Tz,
}

impl CronTrigger {
    pub fn new(
        spec: &CronSpec,
        timezone: Tz,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        // Fields coarser than the finest configured one default to "*", the
        // finer ones to their minimum.
        let finest = FieldKind::ALL
            .iter()
            .rposition(|kind| spec.get(*kind).is_some());
        let fields = FieldKind::ALL
            .iter()
            .enumerate()
            .map(|(i, kind)| match spec.get(*kind) {
                Some(expr) => CronField::parse(*kind, expr, false),
                None if finest.is_some_and(|f| i > f) => {
                    CronField::parse(*kind, kind.default_expr(), true)
                }
                None => CronField::parse(*kind, "*", true),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            fields,
            start_date,
            end_date,
            timezone,
        })
    }

    /// Build from a standard five-field crontab line (`m h dom mon dow`).
    pub fn from_crontab(expr: &str, timezone: Tz) -> Result<Self> {
        Self::new(&CronSpec::from_crontab(expr)?, timezone, None, None)
    }

    pub fn fields(&self) -> &[CronField] {
        &self.fields
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Earliest wall-clock time `>= start` matching every field.
    fn next_matching(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut date = start;
        let mut fieldnum: isize = 0;
        while let Some(field) = usize::try_from(fieldnum)
            .ok()
            .and_then(|i| self.fields.get(i))
        {
            let kind = field.kind();
            let current = kind.get_value(&date);
            match field.next_value(&date) {
                None => {
                    (date, fieldnum) = self.increment_field(&date, fieldnum - 1)?;
                }
                Some(next) if next > current => {
                    if kind.is_real() {
                        date = self.set_field(&date, fieldnum as usize, next)?;
                        fieldnum += 1;
                    } else {
                        (date, fieldnum) = self.increment_field(&date, fieldnum)?;
                    }
                }
                Some(_) => fieldnum += 1,
            }
            if let Some(end) = self.end_date {
                if self.resolve(date) > end {
                    return None;
                }
            }
        }
        (fieldnum >= 0).then_some(date)
    }

    /// Advance the field at `fieldnum` by one, resetting finer fields. Derived
    /// fields pass the increment to the next coarser real field, and a field
    /// already at its maximum carries into the one above it.
    fn increment_field(
        &self,
        date: &NaiveDateTime,
        mut fieldnum: isize,
    ) -> Option<(NaiveDateTime, isize)> {
        let mut values = [0u32; 8];
        let mut i: isize = 0;
        while fieldnum >= 0 && (i as usize) < self.fields.len() {
            let kind = self.fields[i as usize].kind();
            if !kind.is_real() {
                if i == fieldnum {
                    fieldnum -= 1;
                    i -= 1;
                } else {
                    i += 1;
                }
                continue;
            }
            if i < fieldnum {
                values[i as usize] = kind.get_value(date);
                i += 1;
            } else if i > fieldnum {
                values[i as usize] = kind.get_min(date);
                i += 1;
            } else {
                let value = kind.get_value(date);
                if value == kind.get_max(date) {
                    fieldnum -= 1;
                    i -= 1;
                } else {
                    values[i as usize] = value + 1;
                    i += 1;
                }
            }
        }
        if fieldnum < 0 {
            return None;
        }
        Some((build_date(&values)?, fieldnum))
    }

    fn set_field(&self, date: &NaiveDateTime, fieldnum: usize, value: u32) -> Option<NaiveDateTime> {
        let mut values = [0u32; 8];
        for (i, field) in self.fields.iter().enumerate() {
            let kind = field.kind();
            if !kind.is_real() {
                continue;
            }
            values[i] = match i.cmp(&fieldnum) {
                std::cmp::Ordering::Less => kind.get_value(date),
                std::cmp::Ordering::Greater => kind.get_min(date),
                std::cmp::Ordering::Equal => value,
            };
        }
        build_date(&values)
    }

    fn resolve(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        crate::time::localize(&self.timezone, naive)
    }
}

fn build_date(values: &[u32; 8]) -> Option<NaiveDateTime> {
    let year = i32::try_from(values[0]).ok()?;
    NaiveDate::from_ymd_opt(year, values[1], values[2])?.and_hms_opt(values[5], values[6], values[7])
}

impl Trigger for CronTrigger {
    fn next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let lower = match previous {
            Some(prev) => prev.checked_add_signed(Duration::microseconds(1))?,
            None => self.start_date.map_or(now, |start| now.max(start)),
        };
        let mut start = ceil_to_second(lower)?
            .with_timezone(&self.timezone)
            .naive_local();

        loop {
            let naive = self.next_matching(start)?;
            let candidate = match self.timezone.from_local_datetime(&naive) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                // A repeated wall time fires only on its first occurrence.
                LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
                LocalResult::None => Some(shift_out_of_gap(&self.timezone, naive)),
            }
            .filter(|t| *t >= lower);

            if let Some(t) = candidate {
                return match self.end_date {
                    Some(end) if t > end => None,
                    _ => Some(t),
                };
            }
            start = naive.checked_add_signed(Duration::seconds(1))?;
        }
    }
}

impl fmt::Display for CronTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let configured: Vec<String> = self
            .fields
            .iter()
            .filter(|field| !field.is_default())
            .map(ToString::to_string)
            .collect();
        write!(f, "cron[{}]", configured.join(", "))?;
        if let Some(end) = self.end_date {
            write!(f, " until {}", fmt_local(end, &self.timezone))?;
        }
        Ok(())
    }
}

impl Marshal for CronTrigger {
    fn marshal(&self) -> cadence_marshal::Result<Marshaled> {
        let fields: StateMap = self
            .fields
            .iter()
            .map(|field| {
                (
                    field.kind().name().to_string(),
                    StateValue::from(field.source()),
                )
            })
            .collect();
        let configured: Vec<StateValue> = self
            .fields
            .iter()
            .filter(|field| !field.is_default())
            .map(|field| StateValue::from(field.kind().name()))
            .collect();
        Ok(Marshaled::versioned(Self::TYPE_REF, 1)
            .with("fields", fields)
            .with("configured", configured)
            .with("start_date", self.start_date)
            .with("end_date", self.end_date)
            .with("timezone", self.timezone.name()))
    }
}

impl Restore for CronTrigger {
    const TYPE_REF: &'static str = "cadence.trigger.cron";

    fn restore(state: StateMap) -> cadence_marshal::Result<Self> {
        let mut r = StateReader::new(Self::TYPE_REF, state);
        r.version(1)?;
        let sources: BTreeMap<String, StateValue> = r.take_map("fields")?;
        let configured: Vec<String> = r
            .take_list("configured")?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let start_date = r.take_opt_timestamp("start_date")?;
        let end_date = r.take_opt_timestamp("end_date")?;
        let tz_name = r.take_str("timezone")?;
        let timezone = parse_timezone(&tz_name).map_err(|e| r.invalid(e.to_string()))?;

        let mut fields = Vec::with_capacity(FieldKind::ALL.len());
        for kind in FieldKind::ALL {
            let source = sources
                .get(kind.name())
                .and_then(StateValue::as_str)
                .ok_or_else(|| r.invalid(format!("missing cron field '{}'", kind.name())))?;
            let is_default = !configured.iter().any(|c| c == kind.name());
            let field = CronField::parse(kind, source, is_default)
                .map_err(|e| r.invalid(e.to_string()))?;
            fields.push(field);
        }
        Ok(Self {
            fields,
            start_date,
            end_date,
            timezone,
        })
    }
}
