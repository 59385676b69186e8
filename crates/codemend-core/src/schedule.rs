use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Interval ─────────────────────────────────────────────────────────────

/// How often a repository is eligible for a remediation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Interval::Daily),
            "weekly" => Ok(Interval::Weekly),
            "monthly" => Ok(Interval::Monthly),
            other => Err(Error::UnsupportedInterval(other.to_string())),
        }
    }
}

/// Settings files sometimes carry trailing junk after the interval word;
/// only the first whitespace-separated token counts.
pub fn sanitize_interval(raw: &str) -> &str {
    raw.split_whitespace().next().unwrap_or("")
}

// ── Due-time computation ─────────────────────────────────────────────────

const RUN_HOUR_UTC: u32 = 9;

fn at_run_hour(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_milli_opt(RUN_HOUR_UTC, 0, 0, 0)
        .expect("09:00:00.000 is a valid time of day")
        .and_utc()
}

/// Map a last-dispatch time and an interval to the next due instant.
///
/// Pure and deterministic. All computation happens in UTC:
/// - daily: 09:00 UTC on the same calendar day as `last` (not the current day)
/// - weekly: 09:00 UTC on the next Monday strictly after `last`
/// - monthly: 09:00 UTC on the first day of the month after `last`'s month
pub fn due_at(last: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    match interval {
        Interval::Daily => at_run_hour(last.date_naive()),
        Interval::Weekly => {
            // Start from tomorrow; a Monday anchor yields the following Monday.
            let mut day = last.date_naive() + Duration::days(1);
            while day.weekday() != Weekday::Mon {
                day += Duration::days(1);
            }
            at_run_hour(day)
        }
        Interval::Monthly => {
            let (year, month) = if last.month() == 12 {
                (last.year() + 1, 1)
            } else {
                (last.year(), last.month() + 1)
            };
            let first = NaiveDate::from_ymd_opt(year, month, 1)
                .expect("the first of a month always exists");
            at_run_hour(first)
        }
    }
}

// ── Eligibility ──────────────────────────────────────────────────────────

/// The triple consulted on every eligibility check. Never persisted;
/// recomputed from the stored record each time.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleEvaluation {
    pub now: DateTime<Utc>,
    pub last_dispatched_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

impl ScheduleEvaluation {
    pub fn evaluate(now: DateTime<Utc>, last: DateTime<Utc>, interval: Interval) -> Self {
        Self {
            now,
            last_dispatched_at: last,
            due_at: due_at(last, interval),
        }
    }

    /// True iff the due instant has passed and no run has happened at or
    /// after it. Once `last_dispatched_at` is refreshed past `due_at` this
    /// stays false until a new due instant is derived from the new anchor.
    pub fn is_due(&self) -> bool {
        self.now >= self.due_at && self.last_dispatched_at < self.due_at
    }
}
