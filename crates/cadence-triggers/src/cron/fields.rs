use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use super::expressions::Expression;
use crate::error::{Result, TriggerError};

/// Cron fields from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Year,
    Month,
    Day,
    Week,
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

impl FieldKind {
    pub const ALL: [FieldKind; 8] = [
        FieldKind::Year,
        FieldKind::Month,
        FieldKind::Day,
        FieldKind::Week,
        FieldKind::DayOfWeek,
        FieldKind::Hour,
        FieldKind::Minute,
        FieldKind::Second,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Year => "year",
            FieldKind::Month => "month",
            FieldKind::Day => "day",
            FieldKind::Week => "week",
            FieldKind::DayOfWeek => "day_of_week",
            FieldKind::Hour => "hour",
            FieldKind::Minute => "minute",
            FieldKind::Second => "second",
        }
    }

    /// Whether the field is a component of the date itself. `week` and
    /// `day_of_week` are derived, so they are matched by advancing the day.
    pub fn is_real(self) -> bool {
        !matches!(self, FieldKind::Week | FieldKind::DayOfWeek)
    }

    pub fn min_value(self) -> u32 {
        match self {
            FieldKind::Year => 1970,
            FieldKind::Month | FieldKind::Day | FieldKind::Week => 1,
            FieldKind::DayOfWeek | FieldKind::Hour | FieldKind::Minute | FieldKind::Second => 0,
        }
    }

    pub fn max_value(self) -> u32 {
        match self {
            FieldKind::Year => 9999,
            FieldKind::Month => 12,
            FieldKind::Day => 31,
            FieldKind::Week => 53,
            FieldKind::DayOfWeek => 6,
            FieldKind::Hour => 23,
            FieldKind::Minute | FieldKind::Second => 59,
        }
    }

    /// Expression used for an unset field finer than every configured one.
    pub fn default_expr(self) -> &'static str {
        match self {
            FieldKind::Year | FieldKind::Week | FieldKind::DayOfWeek => "*",
            FieldKind::Month | FieldKind::Day => "1",
            FieldKind::Hour | FieldKind::Minute | FieldKind::Second => "0",
        }
    }

    pub fn get_min(self, _date: &NaiveDateTime) -> u32 {
        self.min_value()
    }

    pub fn get_max(self, date: &NaiveDateTime) -> u32 {
        match self {
            FieldKind::Day => days_in_month(date.year(), date.month()),
            _ => self.max_value(),
        }
    }

    pub fn get_value(self, date: &NaiveDateTime) -> u32 {
        match self {
            FieldKind::Year => date.year() as u32,
            FieldKind::Month => date.month(),
            FieldKind::Day => date.day(),
            FieldKind::Week => date.iso_week().week(),
            FieldKind::DayOfWeek => date.weekday().num_days_from_monday(),
            FieldKind::Hour => date.hour(),
            FieldKind::Minute => date.minute(),
            FieldKind::Second => date.second(),
        }
    }
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(31, |d| d.day())
}

/// A parsed cron field: its source text and the expressions it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct CronField {
    kind: FieldKind,
    source: String,
    is_default: bool,
    expressions: Vec<Expression>,
}

impl CronField {
    pub fn parse(kind: FieldKind, source: &str, is_default: bool) -> Result<Self> {
        let expressions = source
            .split(',')
            .map(|part| {
                Expression::parse(kind, part).map_err(|reason| TriggerError::InvalidExpression {
                    field: kind.name(),
                    expr: part.trim().to_string(),
                    reason,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            kind,
            source: source.trim().to_string(),
            is_default,
            expressions,
        })
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the field was filled in rather than configured.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Smallest accepted value `>=` the field's current value in `date`.
    pub fn next_value(&self, date: &NaiveDateTime) -> Option<u32> {
        self.expressions
            .iter()
            .filter_map(|e| e.next_value(self.kind, date))
            .min()
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}='{}'", self.kind.name(), self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn month_lengths() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2100, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }

    #[test]
    fn list_takes_the_smallest_match() {
        let field = CronField::parse(FieldKind::Hour, "22,3,9-11", false).unwrap();
        assert_eq!(field.next_value(&at("2024-01-01 04:00:00")), Some(9));
        assert_eq!(field.next_value(&at("2024-01-01 12:00:00")), Some(22));
        assert_eq!(field.next_value(&at("2024-01-01 23:00:00")), None);
    }

    #[test]
    fn errors_name_field_and_part() {
        let err = CronField::parse(FieldKind::Minute, "5, 61", false).unwrap_err();
        assert!(matches!(
            err,
            TriggerError::InvalidExpression { field: "minute", ref expr, .. } if expr == "61"
        ));
    }

    #[test]
    fn derived_fields_read_from_the_date() {
        let d = at("2024-01-03 10:20:30");
        assert_eq!(FieldKind::DayOfWeek.get_value(&d), 2);
        assert_eq!(FieldKind::Week.get_value(&d), 1);
        assert!(!FieldKind::Week.is_real());
        assert!(FieldKind::Hour.is_real());
    }
}
