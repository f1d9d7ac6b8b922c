use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::combining::{AndTrigger, OrTrigger};
use crate::cron::{CronSpec, CronTrigger};
use crate::date::DateTrigger;
use crate::error::{Result, TriggerError};
use crate::interval::IntervalTrigger;
use crate::time::{parse_datetime, parse_timezone};
use crate::trigger::Trigger;

/// Values a factory may fall back on when the config leaves them out.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext {
    pub timezone: Tz,
    pub now: DateTime<Utc>,
}

impl TriggerContext {
    pub fn new(timezone: Tz, now: DateTime<Utc>) -> Self {
        Self { timezone, now }
    }

    fn timezone_or(&self, name: Option<&str>) -> Result<Tz> {
        name.map_or(Ok(self.timezone), parse_timezone)
    }
}

/// Builds a trigger from its config fields (the table minus `type`).
pub type TriggerFactory = fn(&TriggerRegistry, Value, &TriggerContext) -> Result<Arc<dyn Trigger>>;

/// Name → factory table so configuration can name a trigger kind without
/// knowing its concrete type.
pub struct TriggerRegistry {
    factories: HashMap<String, TriggerFactory>,
}

impl TriggerRegistry {
    /// Registry with `date`, `interval`, `cron`, `and` and `or`.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("date", build_date);
        registry.register("interval", build_interval);
        registry.register("cron", build_cron);
        registry.register("and", build_and);
        registry.register("or", build_or);
        registry
    }

    pub fn register(&mut self, name: &str, factory: TriggerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build from a config table whose `type` key names the trigger.
    pub fn build(&self, config: &Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
        let mut fields = match config {
            Value::Object(map) => map.clone(),
            other => {
                return Err(TriggerError::InvalidConfig(format!(
                    "trigger config must be a table, got {other}"
                )))
            }
        };
        let name = match fields.remove("type") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(TriggerError::InvalidConfig(
                    "trigger config is missing a string 'type'".to_string(),
                ))
            }
        };
        self.build_named(&name, Value::Object(fields), ctx)
    }

    pub fn build_named(&self, name: &str, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TriggerError::UnknownType(name.to_string()))?;
        factory(self, args, ctx)
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn parse_args<T: DeserializeOwned>(kind: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| TriggerError::InvalidConfig(format!("{kind} trigger: {e}")))
}

fn parse_opt_datetime(raw: Option<&str>, tz: &Tz) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_datetime(s, tz)).transpose()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateArgs {
    run_date: Option<String>,
    timezone: Option<String>,
}

fn build_date(_: &TriggerRegistry, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
    let args: DateArgs = parse_args("date", args)?;
    let tz = ctx.timezone_or(args.timezone.as_deref())?;
    let run_date = parse_opt_datetime(args.run_date.as_deref(), &tz)?.unwrap_or(ctx.now);
    Ok(Arc::new(DateTrigger::new(run_date, tz)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct IntervalArgs {
    weeks: i64,
    days: i64,
    hours: i64,
    minutes: i64,
    seconds: i64,
    start_date: Option<String>,
    end_date: Option<String>,
    timezone: Option<String>,
}

fn build_interval(_: &TriggerRegistry, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
    let args: IntervalArgs = parse_args("interval", args)?;
    let tz = ctx.timezone_or(args.timezone.as_deref())?;
    let interval = [
        Duration::try_weeks(args.weeks),
        Duration::try_days(args.days),
        Duration::try_hours(args.hours),
        Duration::try_minutes(args.minutes),
        Duration::try_seconds(args.seconds),
    ]
    .into_iter()
    .try_fold(Duration::zero(), |acc, part| acc.checked_add(&part?))
    .ok_or_else(|| TriggerError::InvalidConfig("interval is too large".to_string()))?;
    // Without an explicit start the first run is one period from now.
    let start_date = match parse_opt_datetime(args.start_date.as_deref(), &tz)? {
        Some(start) => start,
        None => ctx.now + interval,
    };
    let end_date = parse_opt_datetime(args.end_date.as_deref(), &tz)?;
    Ok(Arc::new(IntervalTrigger::new(interval, start_date, end_date, tz)?))
}

#[derive(Debug, Deserialize)]
struct CronArgs {
    #[serde(flatten)]
    fields: CronSpec,
    #[serde(default)]
    crontab: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

fn build_cron(_: &TriggerRegistry, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
    let args: CronArgs = parse_args("cron", args)?;
    let tz = ctx.timezone_or(args.timezone.as_deref())?;
    let start_date = parse_opt_datetime(args.start_date.as_deref(), &tz)?;
    let end_date = parse_opt_datetime(args.end_date.as_deref(), &tz)?;
    let spec = match args.crontab {
        Some(line) => CronSpec::from_crontab(&line)?,
        None => args.fields,
    };
    Ok(Arc::new(CronTrigger::new(&spec, tz, start_date, end_date)?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CombiningArgs {
    triggers: Vec<Value>,
    #[serde(default)]
    tolerance_secs: f64,
}

fn build_children(
    registry: &TriggerRegistry,
    kind: &str,
    configs: &[Value],
    ctx: &TriggerContext,
) -> Result<Vec<Arc<dyn Trigger>>> {
    if configs.is_empty() {
        return Err(TriggerError::InvalidConfig(format!(
            "{kind} trigger needs at least one sub-trigger"
        )));
    }
    configs.iter().map(|c| registry.build(c, ctx)).collect()
}

fn build_and(registry: &TriggerRegistry, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
    let args: CombiningArgs = parse_args("and", args)?;
    if !args.tolerance_secs.is_finite() || args.tolerance_secs < 0.0 {
        return Err(TriggerError::InvalidConfig(
            "and trigger tolerance must be a non-negative number of seconds".to_string(),
        ));
    }
    let triggers = build_children(registry, "and", &args.triggers, ctx)?;
    let tolerance = Duration::microseconds((args.tolerance_secs * 1_000_000.0).round() as i64);
    Ok(Arc::new(AndTrigger::with_tolerance(triggers, tolerance)))
}

fn build_or(registry: &TriggerRegistry, args: Value, ctx: &TriggerContext) -> Result<Arc<dyn Trigger>> {
    let args: CombiningArgs = parse_args("or", args)?;
    let triggers = build_children(registry, "or", &args.triggers, ctx)?;
    Ok(Arc::new(OrTrigger::new(triggers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> TriggerContext {
        TriggerContext::new(Tz::UTC, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn builds_each_registered_kind() {
        let registry = TriggerRegistry::with_defaults();
        let now = ctx().now;

        let date = registry
            .build(&json!({"type": "date", "run_date": "2024-02-01 10:00:00"}), &ctx())
            .unwrap();
        assert_eq!(
            date.next_fire_time(None, now),
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap())
        );

        let interval = registry
            .build(&json!({"type": "interval", "minutes": 1, "seconds": 30}), &ctx())
            .unwrap();
        assert_eq!(
            interval.next_fire_time(None, now),
            Some(now + Duration::seconds(90))
        );

        let cron = registry
            .build(&json!({"type": "cron", "hour": 6, "timezone": "Asia/Tokyo"}), &ctx())
            .unwrap();
        // 06:00 JST is 21:00 UTC the previous day.
        assert_eq!(
            cron.next_fire_time(None, now),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 21, 0, 0).unwrap())
        );
    }

    #[test]
    fn crontab_shorthand_with_dates() {
        let registry = TriggerRegistry::with_defaults();
        let trigger = registry
            .build(
                &json!({"type": "cron", "crontab": "0 0 1 * *", "end_date": "2024-03-15"}),
                &ctx(),
            )
            .unwrap();
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(trigger.next_fire_time(None, ctx().now + Duration::seconds(1)), Some(feb));
        assert_eq!(trigger.next_fire_time(Some(mar), mar), None);
    }

    #[test]
    fn combining_triggers_nest() {
        let registry = TriggerRegistry::with_defaults();
        let trigger = registry
            .build(
                &json!({
                    "type": "or",
                    "triggers": [
                        {"type": "date", "run_date": "2024-01-05T00:00:00Z"},
                        {"type": "and", "tolerance_secs": 0, "triggers": [
                            {"type": "interval", "seconds": 2, "start_date": "2024-01-01 00:00:00"},
                            {"type": "interval", "seconds": 3, "start_date": "2024-01-01 00:00:00"}
                        ]}
                    ]
                }),
                &ctx(),
            )
            .unwrap();
        assert_eq!(
            trigger.next_fire_time(None, ctx().now + Duration::seconds(1)),
            Some(ctx().now + Duration::seconds(6))
        );
    }

    #[test]
    fn reports_configuration_errors() {
        let registry = TriggerRegistry::with_defaults();
        let ctx = ctx();
        assert!(matches!(
            registry.build(&json!({"type": "lunar"}), &ctx),
            Err(TriggerError::UnknownType(name)) if name == "lunar"
        ));
        assert!(matches!(
            registry.build(&json!({"seconds": 5}), &ctx),
            Err(TriggerError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.build(&json!({"type": "interval"}), &ctx),
            Err(TriggerError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.build(&json!({"type": "interval", "secs": 5}), &ctx),
            Err(TriggerError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.build(&json!({"type": "cron", "hour": "25"}), &ctx),
            Err(TriggerError::InvalidExpression { field: "hour", .. })
        ));
        assert!(matches!(
            registry.build(&json!({"type": "and", "triggers": []}), &ctx),
            Err(TriggerError::InvalidConfig(_))
        ));
        assert!(matches!(
            registry.build(&json!({"type": "date", "timezone": "Nowhere/City"}), &ctx),
            Err(TriggerError::UnknownTimezone(_))
        ));
    }
}
