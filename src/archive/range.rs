//! Export Range Resolution
//!
//! Turns a user-supplied range into an ordered, inclusive list of calendar
//! dates relative to "today" in the archive's offset.
//!
//! Accepted forms:
//!
//! | input                      | dates                                  |
//! |----------------------------|----------------------------------------|
//! | `today`, `yesterday`       | one day                                |
//! | `last7days`                | the 7 days ending today                |
//! | `lastweek`                 | previous Monday through Sunday         |
//! | `thismonth`                | the 1st of this month through today    |
//! | `lastmonth`                | the whole previous month               |
//! | `2024-01-05`, `01-05`      | one day (`MM-DD` is in today's year)   |
//! | `2024-01-01,2024-01-03`    | inclusive range                        |

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use std::fmt;

/// Longest range an export may span
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("empty range")]
    Empty,
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("range start {from} is after end {to}")]
    Reversed { from: NaiveDate, to: NaiveDate },
    #[error("range of {days} days exceeds the limit of {max}", max = MAX_RANGE_DAYS)]
    TooLong { days: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    Today,
    Yesterday,
    Last7Days,
    LastWeek,
    ThisMonth,
    LastMonth,
    Day(NaiveDate),
    Between(NaiveDate, NaiveDate),
}

impl RangeSpec {
    /// Parse a range; `today` anchors `MM-DD` dates to the current year.
    pub fn parse(input: &str, today: NaiveDate) -> Result<Self, RangeError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RangeError::Empty);
        }
        let symbolic = match input.to_ascii_lowercase().as_str() {
            "today" => Some(RangeSpec::Today),
            "yesterday" => Some(RangeSpec::Yesterday),
            "last7days" => Some(RangeSpec::Last7Days),
            "lastweek" => Some(RangeSpec::LastWeek),
            "thismonth" => Some(RangeSpec::ThisMonth),
            "lastmonth" => Some(RangeSpec::LastMonth),
            _ => None,
        };
        if let Some(spec) = symbolic {
            return Ok(spec);
        }

        match input.split_once(',') {
            Some((from, to)) => {
                let from = parse_date(from, today)?;
                let to = parse_date(to, today)?;
                Ok(RangeSpec::Between(from, to))
            }
            None => Ok(RangeSpec::Day(parse_date(input, today)?)),
        }
    }

    /// First and last date, inclusive
    pub fn bounds(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let yesterday = today.pred_opt().unwrap_or(today);
        match *self {
            RangeSpec::Today => (today, today),
            RangeSpec::Yesterday => (yesterday, yesterday),
            RangeSpec::Last7Days => (today - ChronoDuration::days(6), today),
            RangeSpec::LastWeek => {
                let this_monday =
                    today - ChronoDuration::days(i64::from(today.weekday().num_days_from_monday()));
                let last_monday = this_monday - ChronoDuration::days(7);
                (last_monday, last_monday + ChronoDuration::days(6))
            }
            RangeSpec::ThisMonth => (first_of_month(today), today),
            RangeSpec::LastMonth => {
                let last_of_prev = first_of_month(today).pred_opt().unwrap_or(today);
                (first_of_month(last_of_prev), last_of_prev)
            }
            RangeSpec::Day(date) => (date, date),
            RangeSpec::Between(from, to) => (from, to),
        }
    }

    /// Every date of the range in ascending order
    pub fn dates(&self, today: NaiveDate) -> Result<Vec<NaiveDate>, RangeError> {
        let (from, to) = self.bounds(today);
        if from > to {
            return Err(RangeError::Reversed { from, to });
        }
        let days = (to - from).num_days() + 1;
        if days > MAX_RANGE_DAYS {
            return Err(RangeError::TooLong { days });
        }
        Ok(from.iter_days().take(days as usize).collect())
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Today => f.write_str("today"),
            RangeSpec::Yesterday => f.write_str("yesterday"),
            RangeSpec::Last7Days => f.write_str("last7days"),
            RangeSpec::LastWeek => f.write_str("lastweek"),
            RangeSpec::ThisMonth => f.write_str("thismonth"),
            RangeSpec::LastMonth => f.write_str("lastmonth"),
            RangeSpec::Day(date) => write!(f, "{}", date),
            RangeSpec::Between(from, to) => write!(f, "{},{}", from, to),
        }
    }
}

/// Parse and expand a range in one step
pub fn resolve_range(input: &str, today: NaiveDate) -> Result<Vec<NaiveDate>, RangeError> {
    RangeSpec::parse(input, today)?.dates(today)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn parse_date(s: &str, today: NaiveDate) -> Result<NaiveDate, RangeError> {
    let s = s.trim();
    let invalid = || RangeError::InvalidDate(s.to_string());
    let parts: Vec<&str> = s.split('-').collect();
    let (year, month, day) = match parts.as_slice() {
        [y, m, d] if y.len() == 4 => (
            y.parse::<i32>().map_err(|_| invalid())?,
            m.parse::<u32>().map_err(|_| invalid())?,
            d.parse::<u32>().map_err(|_| invalid())?,
        ),
        [m, d] => (
            today.year(),
            m.parse::<u32>().map_err(|_| invalid())?,
            d.parse::<u32>().map_err(|_| invalid())?,
        ),
        _ => return Err(invalid()),
    };
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}
