use chrono::{Datelike, NaiveDateTime};

use super::fields::{days_in_month, FieldKind};

pub(crate) const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const POSITIONS: [&str; 6] = ["1st", "2nd", "3rd", "4th", "5th", "last"];

/// Which occurrence of a weekday within a month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// 0-based: `Nth(0)` is the first occurrence.
    Nth(u32),
    Last,
}

/// One comma-separated part of a cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// `*` or `*/step`
    All { step: Option<u32> },
    /// `a`, `a-b`, `a-b/step`, `a/step` (`last: None` runs to the field maximum)
    Range {
        first: u32,
        last: Option<u32>,
        step: Option<u32>,
    },
    /// `1st fri`, `last sun`
    WeekdayPosition { position: Position, weekday: u32 },
    /// `last`
    LastDayOfMonth,
}

impl Expression {
    /// Parse a single expression for `kind`. Returns the reason on failure.
    pub fn parse(kind: FieldKind, raw: &str) -> Result<Self, String> {
        let expr = raw.trim().to_ascii_lowercase();
        if expr.is_empty() {
            return Err("empty expression".to_string());
        }

        if kind == FieldKind::Day {
            if expr == "last" {
                return Ok(Expression::LastDayOfMonth);
            }
            if let Some((pos, day)) = expr.split_once(char::is_whitespace) {
                let position = match POSITIONS.iter().position(|p| *p == pos) {
                    Some(5) => Position::Last,
                    Some(n) => Position::Nth(n as u32),
                    None => return Err(format!("unknown position '{pos}'")),
                };
                let weekday = name_index(&WEEKDAYS, day.trim())
                    .ok_or_else(|| format!("unknown weekday '{}'", day.trim()))?;
                return Ok(Expression::WeekdayPosition { position, weekday });
            }
        }

        let (body, step) = match expr.split_once('/') {
            Some((body, step)) => (body, Some(parse_step(step)?)),
            None => (expr.as_str(), None),
        };

        let parsed = if body == "*" {
            Expression::All { step }
        } else {
            let (first, last) = match body.split_once('-') {
                Some((a, b)) => (parse_value(kind, a)?, Some(parse_value(kind, b)?)),
                None => (parse_value(kind, body)?, None),
            };
            // A bare value with no step matches only itself.
            let last = if last.is_none() && step.is_none() {
                Some(first)
            } else {
                last
            };
            Expression::Range { first, last, step }
        };
        parsed.validate(kind)?;
        Ok(parsed)
    }

    fn validate(&self, kind: FieldKind) -> Result<(), String> {
        let (min, max) = (kind.min_value(), kind.max_value());
        match *self {
            Expression::All { step: Some(step) } if step > max - min => Err(format!(
                "the step value ({step}) is higher than the total range of the expression ({})",
                max - min
            )),
            Expression::Range { first, last, step } => {
                if let Some(last) = last {
                    if first > last {
                        return Err(format!(
                            "the minimum value ({first}) is higher than the maximum value ({last})"
                        ));
                    }
                }
                if first < min {
                    return Err(format!("the first value ({first}) is lower than the minimum ({min})"));
                }
                if let Some(last) = last.filter(|l| *l > max) {
                    return Err(format!("the last value ({last}) is higher than the maximum ({max})"));
                }
                let range = last.unwrap_or(max).saturating_sub(first);
                match step {
                    Some(step) if step > range => Err(format!(
                        "the step value ({step}) is higher than the total range of the expression ({range})"
                    )),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Smallest value `>=` the current value of `kind` in `date` that this
    /// expression accepts, within the bounds valid for `date`.
    pub fn next_value(&self, kind: FieldKind, date: &NaiveDateTime) -> Option<u32> {
        match *self {
            Expression::All { step } => {
                let (min, max) = (kind.get_min(date), kind.get_max(date));
                stepped(kind.get_value(date).max(min), min, step).filter(|v| *v <= max)
            }
            Expression::Range { first, last, step } => {
                let min = kind.get_min(date).max(first);
                let max = match last {
                    Some(last) => kind.get_max(date).min(last),
                    None => kind.get_max(date),
                };
                stepped(kind.get_value(date).max(min), min, step).filter(|v| *v <= max)
            }
            Expression::WeekdayPosition { position, weekday } => {
                let first_of_month = date.date().with_day(1)?;
                let first_wday = first_of_month.weekday().num_days_from_monday();
                let last_day = days_in_month(date.year(), date.month());
                let first_hit = (weekday + 7 - first_wday) % 7 + 1;
                let target = match position {
                    Position::Nth(n) => first_hit + n * 7,
                    Position::Last => first_hit + ((last_day - first_hit) / 7) * 7,
                };
                (target <= last_day && target >= date.day()).then_some(target)
            }
            Expression::LastDayOfMonth => {
                let last_day = days_in_month(date.year(), date.month());
                (last_day >= date.day()).then_some(last_day)
            }
        }
    }
}

fn stepped(start: u32, min: u32, step: Option<u32>) -> Option<u32> {
    match step {
        None => Some(start),
        Some(step) => start.checked_add((step - (start - min) % step) % step),
    }
}

fn parse_step(raw: &str) -> Result<u32, String> {
    let step: u32 = raw
        .trim()
        .parse()
        .map_err(|_| format!("invalid step '{raw}'"))?;
    if step == 0 {
        return Err("the step value must be positive".to_string());
    }
    Ok(step)
}

fn parse_value(kind: FieldKind, raw: &str) -> Result<u32, String> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let named = match kind {
        FieldKind::Month => name_index(&MONTHS, raw).map(|i| i + 1),
        FieldKind::DayOfWeek => name_index(&WEEKDAYS, raw),
        _ => None,
    };
    named.ok_or_else(|| format!("invalid value '{raw}'"))
}

fn name_index(names: &[&str], raw: &str) -> Option<u32> {
    names.iter().position(|n| *n == raw).map(|i| i as u32)
}
