/*!
 * Scheduler
 * Five-field cron expressions (UTC) and the background task that fires
 * newsletter runs on them.
 */
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::newsletter::{DeliveryOptions, NewsletterError};
use crate::state::AppState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Bitset of allowed values for one cron field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }
}

struct FieldBounds {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldBounds = FieldBounds { name: "minute", min: 0, max: 59 };
const HOUR: FieldBounds = FieldBounds { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: FieldBounds = FieldBounds { name: "day-of-month", min: 1, max: 31 };
const MONTH: FieldBounds = FieldBounds { name: "month", min: 1, max: 12 };
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing
const DAY_OF_WEEK: FieldBounds = FieldBounds { name: "day-of-week", min: 0, max: 7 };

fn parse_field(raw: &str, bounds: &FieldBounds) -> Result<FieldSet, ScheduleError> {
    let invalid = || ScheduleError::InvalidField {
        field: bounds.name,
        value: raw.to_string(),
    };
    let number = |s: &str| -> Result<u32, ScheduleError> {
        let n: u32 = s.parse().map_err(|_| invalid())?;
        if n < bounds.min || n > bounds.max {
            return Err(invalid());
        }
        Ok(n)
    };

    let mut bits = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (bounds.min, bounds.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (number(a)?, number(b)?);
            if a > b {
                return Err(invalid());
            }
            (a, b)
        } else {
            let a = number(range)?;
            // "5/15" means every 15 starting at 5
            if part.contains('/') {
                (a, bounds.max)
            } else {
                (a, a)
            }
        };

        let mut value = start;
        while value <= end {
            bits |= 1u64 << value;
            value += step;
        }
    }

    if bits == 0 {
        return Err(invalid());
    }
    Ok(FieldSet(bits))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_any: bool,
    dow_any: bool,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let expanded = match expr.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }

        Ok(Self {
            source: expr.trim().to_string(),
            minutes: parse_field(fields[0], &MINUTE)?,
            hours: parse_field(fields[1], &HOUR)?,
            days_of_month: parse_field(fields[2], &DAY_OF_MONTH)?,
            months: parse_field(fields[3], &MONTH)?,
            days_of_week,
            dom_any: fields[2].starts_with('*'),
            dow_any: fields[4].starts_with('*'),
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.dom_any, self.dow_any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            // Both restricted: classic cron fires when either matches
            (false, false) => dom || dow,
        }
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = start + Duration::days(366 * 4);
        let mut t = start;

        while t <= limit {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }

        None
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Run the newsletter on every fire time of `schedule` until the process exits.
/// Next fire time, never at or before the previous one. A wall clock that
/// lags the sleep timer would otherwise yield the same minute again.
fn next_fire(
    schedule: &Schedule,
    now: DateTime<Utc>,
    last: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = match last {
        Some(last) if last > now => last,
        _ => now,
    };
    schedule.next_after(from)
}

pub fn spawn(state: AppState, schedule: Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(schedule = %schedule, "newsletter scheduler started");
        let mut last_fire = None;

        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now, last_fire) else {
                tracing::warn!(schedule = %schedule, "schedule never fires, scheduler stopped");
                return;
            };

            tracing::info!(next_run = %next, "next scheduled newsletter run");
            tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;
            last_fire = Some(next);

            match state
                .newsletter
                .run_exclusive(
                    &state.run_guard,
                    state.subscribers.as_ref(),
                    &DeliveryOptions::default(),
                )
                .await
            {
                Ok(report) => tracing::info!(
                    delivered = report.delivery.delivered,
                    failed = report.delivery.failed.len(),
                    "scheduled newsletter run completed"
                ),
                Err(NewsletterError::AlreadyRunning) => {
                    tracing::warn!("skipping scheduled run, another run is in progress")
                }
                Err(e) => tracing::error!(error = %e, "scheduled newsletter run failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_lagging_clock_does_not_repeat_fire() {
        let schedule = Schedule::parse("0 8 * * *").unwrap();
        let fired = at(2024, 5, 6, 8, 0);
        // wall clock still reads just before the minute that was slept to
        let lagging = fired - chrono::Duration::milliseconds(300);

        assert_eq!(schedule.next_after(lagging), Some(fired));
        assert_eq!(
            next_fire(&schedule, lagging, Some(fired)),
            Some(at(2024, 5, 7, 8, 0))
        );
    }

    #[test]
    fn test_next_fire_uses_clock_when_ahead() {
        let schedule = Schedule::parse("0 8 * * *").unwrap();
        let last = at(2024, 5, 6, 8, 0);
        let now = at(2024, 5, 8, 9, 0);
        assert_eq!(next_fire(&schedule, now, Some(last)), Some(at(2024, 5, 9, 8, 0)));
        assert_eq!(next_fire(&schedule, now, None), Some(at(2024, 5, 9, 8, 0)));
    }

    #[test]
    fn test_parse_rejects_bad_expressions() {
        assert_eq!(Schedule::parse("* * *"), Err(ScheduleError::FieldCount(3)));
        assert!(Schedule::parse("60 * * * *").is_err());
        assert!(Schedule::parse("* 24 * * *").is_err());
        assert!(Schedule::parse("* * 0 * *").is_err());
        assert!(Schedule::parse("*/0 * * * *").is_err());
        assert!(Schedule::parse("5-1 * * * *").is_err());
        assert!(Schedule::parse("a * * * *").is_err());
    }

    #[test]
    fn test_daily_at_fixed_time() {
        let schedule = Schedule::parse("30 8 * * *").unwrap();
        assert_eq!(schedule.next_after(at(2024, 5, 6, 7, 0)), Some(at(2024, 5, 6, 8, 30)));
        assert_eq!(schedule.next_after(at(2024, 5, 6, 8, 30)), Some(at(2024, 5, 7, 8, 30)));
    }

    #[test]
    fn test_next_after_ignores_seconds() {
        let schedule = Schedule::parse("* * * * *").unwrap();
        let t = Utc.with_ymd_and_hms(2024, 5, 6, 7, 0, 42).unwrap();
        assert_eq!(schedule.next_after(t), Some(at(2024, 5, 6, 7, 1)));
    }

    #[test]
    fn test_steps_and_lists() {
        let schedule = Schedule::parse("*/15 9,17 * * *").unwrap();
        let times = schedule.upcoming(at(2024, 5, 6, 9, 40), 3);
        assert_eq!(times, vec![at(2024, 5, 6, 9, 45), at(2024, 5, 6, 17, 0), at(2024, 5, 6, 17, 15)]);
    }

    #[test]
    fn test_offset_step() {
        let schedule = Schedule::parse("5/20 * * * *").unwrap();
        let times = schedule.upcoming(at(2024, 5, 6, 9, 0), 3);
        assert_eq!(times, vec![at(2024, 5, 6, 9, 5), at(2024, 5, 6, 9, 25), at(2024, 5, 6, 9, 45)]);
    }

    #[test]
    fn test_weekday_range_skips_weekend() {
        // 2024-05-10 is a Friday
        let schedule = Schedule::parse("0 8 * * 1-5").unwrap();
        assert_eq!(schedule.next_after(at(2024, 5, 10, 9, 0)), Some(at(2024, 5, 13, 8, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        let schedule = Schedule::parse("0 10 * * 7").unwrap();
        // 2024-05-12 is a Sunday
        assert_eq!(schedule.next_after(at(2024, 5, 10, 0, 0)), Some(at(2024, 5, 12, 10, 0)));
    }

    #[test]
    fn test_restricted_day_fields_are_ored() {
        // 1st of the month OR any Monday
        let schedule = Schedule::parse("0 0 1 * 1").unwrap();
        // 2024-05-01 is a Wednesday, 2024-05-06 a Monday
        assert_eq!(schedule.next_after(at(2024, 4, 30, 1, 0)), Some(at(2024, 5, 1, 0, 0)));
        assert_eq!(schedule.next_after(at(2024, 5, 1, 0, 0)), Some(at(2024, 5, 6, 0, 0)));
    }

    #[test]
    fn test_month_rollover_and_leap_day() {
        let schedule = Schedule::parse("0 12 29 2 *").unwrap();
        assert_eq!(schedule.next_after(at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 12, 0)));
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let schedule = Schedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(schedule.next_after(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_aliases() {
        let weekly: Schedule = "@weekly".parse().unwrap();
        assert_eq!(weekly.next_after(at(2024, 5, 8, 0, 0)), Some(at(2024, 5, 12, 0, 0)));
        assert_eq!(weekly.to_string(), "@weekly");
        let daily = Schedule::parse("@daily").unwrap();
        assert_eq!(daily.next_after(at(2024, 12, 31, 23, 59)), Some(at(2025, 1, 1, 0, 0)));
    }
}
