//! Standard 5-field cron expression parsing and slot computation.
//!
//! Minute, hour, day-of-month, month, day-of-week, each accepting `*`,
//! a single value, a comma-separated list, a range (`a-b`), or a
//! stepped range/wildcard (`*/n`, `a-b/n`). When both day-of-month and
//! day-of-week are restricted (neither is `*`), a slot matches if
//! either field matches -- standard vixie-cron OR semantics.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 5 whitespace-separated fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid value {value} in field '{field}' (expected {min}-{max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("malformed field '{field}': {raw}")]
    Malformed { field: &'static str, raw: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSpec {
    /// `true` means the field was `*` and imposes no constraint.
    wildcard: bool,
    values: Vec<u32>,
}

impl FieldSpec {
    fn matches(&self, value: u32) -> bool {
        self.wildcard || self.values.contains(&value)
    }

    fn parse(raw: &str, field: &'static str, min: u32, max: u32) -> Result<Self, CronError> {
        let mut values = Vec::new();
        let mut wildcard = false;

        for part in raw.split(',') {
            let (range_part, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| CronError::Malformed { field, raw: raw.to_string() })?;
                    if step == 0 {
                        return Err(CronError::Malformed { field, raw: raw.to_string() });
                    }
                    (r, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range_part == "*" {
                if step == 1 {
                    wildcard = true;
                }
                (min, max)
            } else if let Some((a, b)) = range_part.split_once('-') {
                let lo: u32 = a
                    .parse()
                    .map_err(|_| CronError::Malformed { field, raw: raw.to_string() })?;
                let hi: u32 = b
                    .parse()
                    .map_err(|_| CronError::Malformed { field, raw: raw.to_string() })?;
                (lo, hi)
            } else {
                let v: u32 = range_part
                    .parse()
                    .map_err(|_| CronError::Malformed { field, raw: raw.to_string() })?;
                (v, v)
            };

            if lo < min || hi > max || lo > hi {
                return Err(CronError::OutOfRange { field, value: lo, min, max });
            }

            let mut v = lo;
            while v <= hi {
                values.push(v);
                v += step;
            }
        }

        values.sort_unstable();
        values.dedup();
        Ok(FieldSpec { wildcard, values })
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: FieldSpec,
    hour: FieldSpec,
    day_of_month: FieldSpec,
    month: FieldSpec,
    day_of_week: FieldSpec,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }

        Ok(CronSchedule {
            minute: FieldSpec::parse(fields[0], "minute", 0, 59)?,
            hour: FieldSpec::parse(fields[1], "hour", 0, 23)?,
            day_of_month: FieldSpec::parse(fields[2], "day_of_month", 1, 31)?,
            month: FieldSpec::parse(fields[3], "month", 1, 12)?,
            day_of_week: FieldSpec::parse(fields[4], "day_of_week", 0, 6)?,
        })
    }

    fn day_matches(&self, dom: u32, dow: u32) -> bool {
        let dom_restricted = !self.day_of_month.wildcard;
        let dow_restricted = !self.day_of_week.wildcard;

        match (dom_restricted, dow_restricted) {
            (true, true) => self.day_of_month.matches(dom) || self.day_of_week.matches(dow),
            (true, false) => self.day_of_month.matches(dom),
            (false, true) => self.day_of_week.matches(dow),
            (false, false) => true,
        }
    }

    fn matches(&self, dt: &DateTime<Tz>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.day_matches(dt.day(), dt.weekday().num_days_from_sunday())
    }

    /// The earliest matching minute strictly after `after`, in `tz`.
    /// Bounded to four years out so a pathological expression (e.g. Feb
    /// 30 via a day-of-month/month combination with no valid dates)
    /// can't spin forever.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&tz);
        let mut candidate = (start + chrono::Duration::minutes(1))
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))?;

        let limit = start + chrono::Duration::days(4 * 365);
        while candidate < limit {
            if self.matches(&candidate) {
                return Some(candidate.with_timezone(&Utc));
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }

    /// Every matching minute in `(from, to]`, in `tz`, used by the
    /// catchup missed-run policy. Callers cap how many of these get
    /// enqueued; this just enumerates.
    pub fn slots_between(&self, from: DateTime<Utc>, to: DateTime<Utc>, tz: Tz) -> Vec<DateTime<Utc>> {
        let mut slots = Vec::new();
        let mut cursor = from;
        loop {
            match self.next_after(cursor, tz) {
                Some(slot) if slot <= to => {
                    slots.push(slot);
                    cursor = slot;
                }
                _ => break,
            }
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(CronSchedule::parse("* * *"), Err(CronError::WrongFieldCount(3)));
    }

    #[test]
    fn every_minute_matches_anything() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let dt = Utc.with_ymd_and_hms(2026, 3, 15, 12, 34, 0).unwrap();
        assert!(cron.matches(&dt.with_timezone(&chrono_tz::UTC)));
    }

    #[test]
    fn step_expression_matches_multiples() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        assert!(cron.minute.matches(0));
        assert!(cron.minute.matches(15));
        assert!(cron.minute.matches(45));
        assert!(!cron.minute.matches(20));
    }

    #[test]
    fn comma_list_and_range_combine() {
        let cron = CronSchedule::parse("0 9-11,17 * * *").unwrap();
        assert!(cron.hour.matches(9));
        assert!(cron.hour.matches(10));
        assert!(cron.hour.matches(17));
        assert!(!cron.hour.matches(12));
    }

    #[test]
    fn dom_and_dow_restricted_use_or_semantics() {
        // 15th of the month OR a Monday.
        let cron = CronSchedule::parse("0 0 15 * 1").unwrap();
        let the_15th_wednesday = Utc.with_ymd_and_hms(2026, 4, 15, 0, 0, 0).unwrap();
        let a_monday_not_15th = Utc.with_ymd_and_hms(2026, 4, 13, 0, 0, 0).unwrap();
        let neither = Utc.with_ymd_and_hms(2026, 4, 14, 0, 0, 0).unwrap();

        assert!(cron.matches(&the_15th_wednesday.with_timezone(&chrono_tz::UTC)));
        assert!(cron.matches(&a_monday_not_15th.with_timezone(&chrono_tz::UTC)));
        assert!(!cron.matches(&neither.with_timezone(&chrono_tz::UTC)));
    }

    #[test]
    fn next_after_finds_next_five_minute_slot() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 2, 30).unwrap();
        let next = cron.next_after(after, chrono_tz::UTC).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn slots_between_enumerates_every_missed_slot() {
        let cron = CronSchedule::parse("*/10 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2026, 1, 1, 0, 31, 0).unwrap();
        let slots = cron.slots_between(from, to, chrono_tz::UTC);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0], Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap());
        assert_eq!(slots[2], Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap());
    }

    #[test]
    fn invalid_minute_rejected() {
        let err = CronSchedule::parse("60 * * * *").unwrap_err();
        assert!(matches!(err, CronError::OutOfRange { field: "minute", .. }));
    }
}
