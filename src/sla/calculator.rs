//! Business-hours deadline arithmetic.
//!
//! The walk happens in the calendar's local time so that working hours stay
//! anchored to the office clock across DST changes; only the final instant is
//! converted back to UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::settings::BusinessCalendar;

/// Deadline for an SLA of `required_hours` starting at `start`.
///
/// Wall-clock arithmetic applies when `business_hours_only` is false, the
/// calendar is disabled, or the calendar is invalid. Otherwise only working
/// hours count, and a budget that runs out exactly at the end of a working
/// day lands on that boundary.
pub fn deadline(
    start: DateTime<Utc>,
    required_hours: u32,
    business_hours_only: bool,
    calendar: &BusinessCalendar,
) -> DateTime<Utc> {
    let wall_clock = start + Duration::hours(i64::from(required_hours));
    if !business_hours_only || !calendar.enabled {
        return wall_clock;
    }
    if !calendar.is_valid() {
        warn!(
            start_hour = calendar.start_hour,
            end_hour = calendar.end_hour,
            weekdays = calendar.weekdays.len(),
            "Invalid business calendar, using wall-clock deadline"
        );
        return wall_clock;
    }
    if required_hours == 0 {
        return start;
    }

    let tz = calendar.timezone;
    let mut cursor = start.with_timezone(&tz).naive_local();
    let mut remaining = Duration::hours(i64::from(required_hours));

    // Every business day consumes at least one hour, and at most six days
    // in a row can be skipped.
    let max_iterations = (u64::from(required_hours) + 1) * 7 + 7;
    for _ in 0..max_iterations {
        let date = cursor.date();
        if !calendar.is_business_day(date.weekday()) {
            cursor = next_day_start(date, calendar);
            continue;
        }

        let day_start = at_hour(date, calendar.start_hour);
        let day_end = at_hour(date, calendar.end_hour);
        if cursor < day_start {
            cursor = day_start;
        }
        if cursor >= day_end {
            cursor = next_day_start(date, calendar);
            continue;
        }

        let left_today = day_end - cursor;
        if remaining <= left_today {
            return to_utc(tz, cursor + remaining);
        }
        remaining -= left_today;
        cursor = next_day_start(date, calendar);
    }

    warn!(required_hours, "Business-hours walk did not converge, using wall-clock deadline");
    wall_clock
}

/// `date` at `hour` local time. `hour` may be 24, meaning the next midnight.
fn at_hour(date: NaiveDate, hour: u32) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN) + Duration::hours(i64::from(hour))
}

fn next_day_start(date: NaiveDate, calendar: &BusinessCalendar) -> NaiveDateTime {
    let next = date.succ_opt().unwrap_or(date);
    at_hour(next, calendar.start_hour)
}

/// Convert a local time to UTC. Ambiguous times take the earlier instant;
/// times inside a DST gap move forward to the first valid instant.
fn to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut probe = local;
    for _ in 0..4 {
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return dt.with_timezone(&Utc);
        }
        probe += Duration::minutes(30);
    }
    Utc.from_utc_datetime(&local)
}
