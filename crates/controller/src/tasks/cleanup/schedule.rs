//! Cron gate
//!
//! Parses standard five-field cron expressions (minute, hour, day-of-month,
//! month, day-of-week) and decides whether a policy is due. Times are
//! evaluated in UTC at minute granularity.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use std::fmt;
use thiserror::Error;

/// How far ahead `next_after` searches before giving up
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),

    #[error("{field} field {value:?}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Decision of the cron gate for one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// The policy is due (or has no schedule)
    Run,
    /// The next fire time is still in the future
    Wait { until: DateTime<Utc> },
    /// The expression can never fire
    Never,
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    allows_question_mark: bool,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
    allows_question_mark: false,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
    allows_question_mark: false,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
    allows_question_mark: true,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some(&MONTH_NAMES),
    allows_question_mark: false,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 6,
    names: Some(&WEEKDAY_NAMES),
    allows_question_mark: true,
};

/// Set of allowed values for one field, plus whether it was written as a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    wildcard: bool,
}

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> ScheduleError {
        ScheduleError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn parse(&self, raw: &str) -> Result<FieldSet, ScheduleError> {
        let mut set = FieldSet {
            bits: 0,
            wildcard: false,
        };
        for part in raw.split(',') {
            let (bits, wildcard) = self.parse_part(part)?;
            set.bits |= bits;
            set.wildcard |= wildcard;
        }
        Ok(set)
    }

    fn parse_part(&self, part: &str) -> Result<(u64, bool), ScheduleError> {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| self.error(part, format!("invalid step {step:?}")))?;
                if step == 0 {
                    return Err(self.error(part, "step must be a positive number"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let is_wildcard = range == "*" || (range == "?" && self.allows_question_mark);
        let (start, end) = if is_wildcard {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (self.value(part, lo)?, self.value(part, hi)?)
        } else {
            let start = self.value(part, range)?;
            // `a/n` means every n-th value from a up to the field maximum
            let end = if step.is_some() { self.max } else { start };
            (start, end)
        };

        if start > end {
            return Err(self.error(
                part,
                format!("beginning of range ({start}) beyond end of range ({end})"),
            ));
        }

        let step = step.unwrap_or(1);
        let mut bits = 0u64;
        let mut value = start;
        while value <= end {
            bits |= 1u64 << value;
            value = value.saturating_add(step);
        }

        Ok((bits, is_wildcard && step == 1))
    }

    fn value(&self, part: &str, token: &str) -> Result<u32, ScheduleError> {
        if let Some(names) = self.names {
            if let Some(index) = names.iter().position(|n| n.eq_ignore_ascii_case(token)) {
                let index = u32::try_from(index).unwrap_or(u32::MAX);
                return Ok(index + self.min);
            }
        }

        let value: u32 = token
            .parse()
            .map_err(|_| self.error(part, format!("failed to parse {token:?}")))?;
        if value < self.min {
            return Err(self.error(
                part,
                format!("value ({value}) below minimum ({})", self.min),
            ));
        }
        if value > self.max {
            return Err(self.error(
                part,
                format!("value ({value}) above maximum ({})", self.max),
            ));
        }
        Ok(value)
    }
}

/// A parsed five-field cron expression
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronSchedule {
    /// Parses a five-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week: DAY_OF_WEEK.parse(fields[4])?,
        })
    }

    /// First fire time strictly after `after`, or `None` when the expression
    /// does not fire within the search horizon.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start.year() + SEARCH_YEARS;
        let mut t = start;

        while t.year() <= horizon {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
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

    /// Standard cron day rule: when both day fields are restricted a day
    /// matches if either does; otherwise both must match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.wildcard || self.days_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Gate decision given the last recorded run.
    ///
    /// A policy that never ran is measured from the Unix epoch, so it is due
    /// immediately.
    #[must_use]
    pub fn gate(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Gate {
        let baseline = last_run.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        match self.next_after(baseline) {
            Some(next) if next > now => Gate::Wait { until: next },
            Some(_) => Gate::Run,
            None => Gate::Never,
        }
    }
}

/// Evaluates an optional schedule. Policies without a schedule always run.
pub fn evaluate(
    schedule: Option<&str>,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Gate, ScheduleError> {
    match schedule {
        None => Ok(Gate::Run),
        Some(expr) => Ok(CronSchedule::parse(expr)?.gate(last_run, now)),
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
