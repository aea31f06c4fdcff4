//! Reporting-week arithmetic.
//!
//! Charts are published per Friday→Friday week. A week is identified by
//! its starting Friday, and downloads are requested as
//! `{start}--{start + 7}`.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Date format used in file names, URLs and object metadata.
pub const ISO_DATE: &str = "%Y-%m-%d";

/// Round `date` down to the most recent Friday on or before it.
pub fn most_recent_friday(date: NaiveDate) -> NaiveDate {
    let weekday = date.weekday().num_days_from_monday() as i64;
    let friday = Weekday::Fri.num_days_from_monday() as i64;
    if weekday >= friday {
        date - Duration::days(weekday - friday)
    } else {
        date - Duration::days(weekday + 3)
    }
}

/// One Friday→Friday reporting week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportingWeek {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportingWeek {
    pub fn starting(start: NaiveDate) -> Self {
        Self {
            start,
            end: start + Duration::days(7),
        }
    }
}

/// Iterator over consecutive reporting weeks.
///
/// Starts at the Friday on or before `from` and stops before yielding a
/// week whose end would pass `until`.
#[derive(Debug, Clone)]
pub struct ReportingWeeks {
    next: ReportingWeek,
    until: NaiveDate,
}

impl Iterator for ReportingWeeks {
    type Item = ReportingWeek;

    fn next(&mut self) -> Option<ReportingWeek> {
        if self.next.end > self.until {
            return None;
        }
        let current = self.next;
        self.next = ReportingWeek::starting(current.end);
        Some(current)
    }
}

pub fn reporting_weeks(from: NaiveDate, until: NaiveDate) -> ReportingWeeks {
    ReportingWeeks {
        next: ReportingWeek::starting(most_recent_friday(from)),
        until,
    }
}

pub fn parse_iso_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), ISO_DATE)
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

pub fn format_iso_date(date: NaiveDate) -> String {
    date.format(ISO_DATE).to_string()
}
