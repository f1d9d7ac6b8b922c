use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::{Result, TriggerError};

/// Turn a wall-clock time in `tz` into an instant.
///
/// Ambiguous wall times (clocks turned back) resolve to the earlier instant.
/// Wall times inside a gap (clocks turned forward) move forward by the size of
/// the gap, so 02:30 on a 02:00 → 03:00 transition becomes 03:30.
pub fn localize(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => shift_out_of_gap(tz, naive),
    }
}

/// Interpret a nonexistent wall time with the offset in force before the gap.
pub(crate) fn shift_out_of_gap(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let before = tz
        .offset_from_utc_datetime(&(naive - Duration::hours(24)))
        .fix();
    let utc = naive - Duration::seconds(i64::from(before.local_minus_utc()));
    Utc.from_utc_datetime(&utc)
}

/// Round up to the next whole second (unchanged if already whole). `None`
/// when that second is past the last representable instant.
pub fn ceil_to_second(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let nanos = t.nanosecond() % 1_000_000_000;
    if nanos == 0 {
        Some(t)
    } else {
        t.checked_add_signed(Duration::nanoseconds(i64::from(1_000_000_000 - nanos)))
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| TriggerError::UnknownTimezone(name.to_string()))
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD[ HH:MM[:SS[.f]]]`
/// interpreted as wall time in `tz`.
pub fn parse_datetime(raw: &str, tz: &Tz) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(localize(tz, naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(localize(tz, date.and_time(chrono::NaiveTime::MIN)));
    }
    Err(TriggerError::InvalidDatetime(raw.to_string()))
}

/// `1 day, 2:03:04`-style rendering used in trigger descriptions.
pub(crate) fn fmt_duration(d: Duration) -> String {
    let total = d.num_seconds();
    let days = total / 86_400;
    let rem = total % 86_400;
    let hms = format!("{}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60);
    let micros = d.subsec_nanos() / 1_000;
    let hms = if micros > 0 {
        format!("{hms}.{micros:06}")
    } else {
        hms
    };
    match days {
        0 => hms,
        1 => format!("1 day, {hms}"),
        n => format!("{n} days, {hms}"),
    }
}

/// Render an instant as wall time in `tz` for `Display` impls.
pub(crate) fn fmt_local(t: DateTime<Utc>, tz: &Tz) -> String {
    t.with_timezone(tz).format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn gap_times_move_forward() {
        let tz: Tz = "Europe/Helsinki".parse().unwrap();
        // Clocks go from 03:00 to 04:00 (UTC+2 → UTC+3).
        let t = localize(&tz, naive("2024-03-31 03:30:00"));
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap());
        assert_eq!(
            t.with_timezone(&tz).naive_local(),
            naive("2024-03-31 04:30:00")
        );
    }

    #[test]
    fn ambiguous_times_take_the_earlier_instant() {
        let tz: Tz = "Europe/Helsinki".parse().unwrap();
        // 03:30 happens twice on 2024-10-27: first at UTC+3, then at UTC+2.
        let t = localize(&tz, naive("2024-10-27 03:30:00"));
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap());
    }

    #[test]
    fn ceil_rounds_up_fractional_seconds() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(ceil_to_second(t), Some(t));
        assert_eq!(
            ceil_to_second(t + Duration::microseconds(1)),
            Some(t + Duration::seconds(1))
        );
        assert_eq!(ceil_to_second(DateTime::<Utc>::MAX_UTC), None);
    }

    #[test]
    fn parses_rfc3339_and_local_forms() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 7, 1, 13, 0, 0).unwrap();
        assert_eq!(parse_datetime("2024-07-01T13:00:00Z", &tz).unwrap(), expected);
        assert_eq!(parse_datetime("2024-07-01 09:00:00", &tz).unwrap(), expected);
        assert_eq!(parse_datetime("2024-07-01 09:00", &tz).unwrap(), expected);
        assert!(parse_datetime("yesterday", &tz).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(TriggerError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn durations_render_like_clock_time() {
        assert_eq!(fmt_duration(Duration::seconds(5)), "0:00:05");
        assert_eq!(fmt_duration(Duration::seconds(90_061)), "1 day, 1:01:01");
        assert_eq!(fmt_duration(Duration::days(3)), "3 days, 0:00:00");
    }
}
