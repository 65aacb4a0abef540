//! Five-field cron expressions: `minute hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, `N`, `A-B`, lists (`1,3,5`) and steps (`*/15`, `1-5/2`).
//! Day-of-week is 0–7 with both 0 and 7 meaning Sunday. When both day fields
//! are restricted a day matches if either does (classic cron semantics).

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Search horizon; covers Feb 29 schedules.
const MAX_DAYS_AHEAD: i64 = 366 * 8;

#[derive(Debug, Error, PartialEq)]
pub enum CronError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("bad {field} field '{value}'")]
    BadField { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

fn parse_field(field: &'static str, value: &str, min: u32, max: u32) -> Result<u64, CronError> {
    let bad = || CronError::BadField { field, value: value.to_string() };
    let mut mask = 0u64;

    for part in value.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, s.parse::<u32>().map_err(|_| bad())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(bad());
        }

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (a.parse().map_err(|_| bad())?, b.parse().map_err(|_| bad())?)
        } else {
            let n: u32 = range.parse().map_err(|_| bad())?;
            // "5/10" means "from 5 to max every 10"
            if part.contains('/') { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(bad());
        }
        for n in (lo..=hi).step_by(step as usize) {
            mask |= 1 << n;
        }
    }

    Ok(mask)
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut weekdays = parse_field("day-of-week", fields[4], 0, 7)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            expr: fields.join(" "),
            minutes: parse_field("minute", fields[0], 0, 59)?,
            hours: parse_field("hour", fields[1], 0, 23)?,
            days: parse_field("day-of-month", fields[2], 1, 31)?,
            months: parse_field("month", fields[3], 1, 12)?,
            weekdays,
            days_restricted: fields[2] != "*",
            weekdays_restricted: fields[4] != "*",
        })
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl CronSchedule {
    fn day_matches(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days & (1 << date.day()) != 0;
        let dow = self.weekdays & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching wall-clock minute strictly after `after`, in `after`'s zone.
    /// Local times skipped by a DST jump are skipped here too.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let start: NaiveDateTime = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        let mut date = start.date();
        for _ in 0..MAX_DAYS_AHEAD {
            if self.day_matches(date) {
                let first_hour = if date == start.date() { start.hour() } else { 0 };
                for hour in first_hour..24 {
                    if self.hours & (1 << hour) == 0 {
                        continue;
                    }
                    let first_minute =
                        if date == start.date() && hour == start.hour() { start.minute() } else { 0 };
                    for minute in first_minute..60 {
                        if self.minutes & (1 << minute) == 0 {
                            continue;
                        }
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
                            return Some(dt);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("31 9 * *".parse::<CronSchedule>(), Err(CronError::FieldCount(4)));
        assert!("60 9 * * *".parse::<CronSchedule>().is_err());
        assert!("31 9 * * 1-9".parse::<CronSchedule>().is_err());
        assert!("*/0 * * * *".parse::<CronSchedule>().is_err());
        assert!("5-1 * * * *".parse::<CronSchedule>().is_err());
        assert!("a * * * *".parse::<CronSchedule>().is_err());
    }

    #[test]
    fn test_market_open_on_weekdays() {
        let open: CronSchedule = "31 9 * * 1-5".parse().unwrap();

        // Monday 2024-03-04 08:00 → same day 09:31
        assert_eq!(open.next_after(&at(2024, 3, 4, 8, 0)), Some(at(2024, 3, 4, 9, 31)));
        // Exactly at fire time → next business day
        assert_eq!(open.next_after(&at(2024, 3, 4, 9, 31)), Some(at(2024, 3, 5, 9, 31)));
        // Friday evening → Monday
        let next = open.next_after(&at(2024, 3, 8, 17, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 11, 9, 31));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_market_close_in_fixed_offset() {
        let close: CronSchedule = "1 16 * * 1-5".parse().unwrap();
        let est = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = est.with_ymd_and_hms(2024, 1, 5, 16, 0, 30).unwrap();
        let next = close.next_after(&now).unwrap();
        assert_eq!(next, est.with_ymd_and_hms(2024, 1, 5, 16, 1, 0).unwrap());
        assert_eq!(next.with_timezone(&Utc), at(2024, 1, 5, 21, 1));
    }

    #[test]
    fn test_steps_lists_and_sunday_alias() {
        let every_15: CronSchedule = "*/15 * * * *".parse().unwrap();
        assert_eq!(every_15.next_after(&at(2024, 1, 1, 10, 16)), Some(at(2024, 1, 1, 10, 30)));

        let sunday: CronSchedule = "0 12 * * 7".parse().unwrap();
        assert_eq!(sunday.next_after(&at(2024, 3, 4, 0, 0)), Some(at(2024, 3, 10, 12, 0)));

        let list: CronSchedule = "0 9,17 * * *".parse().unwrap();
        assert_eq!(list.next_after(&at(2024, 3, 4, 9, 0)), Some(at(2024, 3, 4, 17, 0)));
        assert_eq!(list.to_string(), "0 9,17 * * *");
    }

    #[test]
    fn test_day_of_month_or_weekday() {
        // 1st of the month OR any Friday
        let s: CronSchedule = "0 0 1 * 5".parse().unwrap();
        assert_eq!(s.next_after(&at(2024, 3, 4, 0, 0)), Some(at(2024, 3, 8, 0, 0)));
        assert_eq!(s.next_after(&at(2024, 3, 29, 0, 0)), Some(at(2024, 4, 1, 0, 0)));

        let leap: CronSchedule = "0 0 29 2 *".parse().unwrap();
        assert_eq!(leap.next_after(&at(2024, 3, 1, 0, 0)), Some(at(2028, 2, 29, 0, 0)));
    }
}
