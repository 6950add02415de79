//! Recurring-interval schedules of the form `R<repeat>/<start>/P<period>`.
//!
//! Periods are converted to fixed spans with 1 year = 365 days and
//! 1 month = 30 days. The conversion is deliberately not calendar-aware: a
//! job scheduled every `P1M` drifts against real month boundaries.

use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 60.0 * SECS_PER_MINUTE;
const SECS_PER_DAY: f64 = 24.0 * SECS_PER_HOUR;
const SECS_PER_WEEK: f64 = 7.0 * SECS_PER_DAY;
const SECS_PER_MONTH: f64 = 30.0 * SECS_PER_DAY;
const SECS_PER_YEAR: f64 = 365.0 * SECS_PER_DAY;

/// How many runs a schedule allows after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    Unbounded,
    Times(u64),
}

impl Repeat {
    /// Whether a job that already ran `times_run` times may run again.
    ///
    /// `Times(n)` allows `n + 1` runs in total: the first one plus `n` repeats.
    pub fn allows_run(&self, times_run: u64) -> bool {
        match self {
            Repeat::Unbounded => true,
            Repeat::Times(n) => times_run <= *n,
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, Repeat::Times(_))
    }
}

/// A calendar-approximate duration. Every component is finite and `>= 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDuration {
    pub years: f64,
    pub months: f64,
    pub weeks: f64,
    pub days: f64,
    pub hours: f64,
    pub minutes: f64,
    pub seconds: f64,
}

impl ScheduleDuration {
    /// Parse an ISO-8601 style duration such as `P1.3WT2M` or `PT30S`.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('P')
            .ok_or_else(|| invalid(format!("duration must start with 'P': {s:?}")))?;

        let mut out = ScheduleDuration::default();
        let mut seen = [false; 7];
        let mut in_time = false;
        let mut time_components = 0;
        let mut rest = body;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('T') {
                if in_time {
                    return Err(invalid(format!("duplicate 'T' in duration {s:?}")));
                }
                in_time = true;
                rest = after;
                continue;
            }

            let num_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            if num_len == 0 {
                return Err(invalid(format!("expected a number in duration {s:?}")));
            }
            let number: f64 = rest[..num_len]
                .parse()
                .map_err(|_| invalid(format!("bad number {:?} in duration {s:?}", &rest[..num_len])))?;

            let unit = rest[num_len..]
                .chars()
                .next()
                .ok_or_else(|| invalid(format!("missing unit after {number} in duration {s:?}")))?;
            let slot = match (in_time, unit) {
                (false, 'Y') => 0,
                (false, 'M') => 1,
                (false, 'W') => 2,
                (false, 'D') => 3,
                (true, 'H') => 4,
                (true, 'M') => 5,
                (true, 'S') => 6,
                _ => return Err(invalid(format!("unknown unit {unit:?} in duration {s:?}"))),
            };
            if seen[slot] {
                return Err(invalid(format!("duplicate unit {unit:?} in duration {s:?}")));
            }
            seen[slot] = true;
            if in_time {
                time_components += 1;
            }

            let field = match slot {
                0 => &mut out.years,
                1 => &mut out.months,
                2 => &mut out.weeks,
                3 => &mut out.days,
                4 => &mut out.hours,
                5 => &mut out.minutes,
                _ => &mut out.seconds,
            };
            *field = number;
            rest = &rest[num_len + unit.len_utf8()..];
        }

        if !seen.iter().any(|s| *s) {
            return Err(invalid(format!("empty duration {s:?}")));
        }
        if in_time && time_components == 0 {
            return Err(invalid(format!("'T' without time components in {s:?}")));
        }
        Ok(out)
    }

    /// Total length in seconds under the fixed 365-day-year / 30-day-month model.
    pub fn total_seconds(&self) -> f64 {
        self.years * SECS_PER_YEAR
            + self.months * SECS_PER_MONTH
            + self.weeks * SECS_PER_WEEK
            + self.days * SECS_PER_DAY
            + self.hours * SECS_PER_HOUR
            + self.minutes * SECS_PER_MINUTE
            + self.seconds
    }

    /// Convert to a fixed span with nanosecond resolution.
    ///
    /// Spans beyond what `chrono::Duration` can hold saturate at its maximum.
    pub fn to_duration(&self) -> Duration {
        let nanos = (self.total_seconds() * 1e9).round();
        if !nanos.is_finite() || nanos >= i64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::nanoseconds(nanos.max(0.0) as i64)
    }
}

impl fmt::Display for ScheduleDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ];
        let time = [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')];

        f.write_str("P")?;
        for (value, unit) in date.iter().filter(|(v, _)| *v != 0.0) {
            write!(f, "{value}{unit}")?;
        }
        let has_date = date.iter().any(|(v, _)| *v != 0.0);
        let has_time = time.iter().any(|(v, _)| *v != 0.0);
        if has_time || !has_date {
            f.write_str("T")?;
        }
        if !has_time && !has_date {
            return f.write_str("0S");
        }
        for (value, unit) in time.iter().filter(|(v, _)| *v != 0.0) {
            write!(f, "{value}{unit}")?;
        }
        Ok(())
    }
}

/// A parsed recurring schedule. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub repeat: Repeat,
    pub start_time: DateTime<Utc>,
    pub period: ScheduleDuration,
}

impl Schedule {
    /// Parse, resolving an omitted start time to the current instant.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_at(s, Utc::now())
    }

    /// Parse, resolving an omitted start time to `now`.
    pub fn parse_at(s: &str, now: DateTime<Utc>) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(invalid(format!(
                "schedule must have 3 '/'-separated parts, got {}: {s:?}",
                parts.len()
            )));
        }

        let repeat = match parts[0].strip_prefix('R') {
            None => return Err(invalid(format!("schedule must start with 'R': {s:?}"))),
            Some("") => Repeat::Unbounded,
            Some(n) => Repeat::Times(
                n.parse()
                    .map_err(|_| invalid(format!("repeat count {n:?} is not a non-negative integer")))?,
            ),
        };

        let start_time = if parts[1].is_empty() {
            now
        } else {
            DateTime::parse_from_rfc3339(parts[1])
                .map_err(|e| invalid(format!("bad start time {:?}: {e}", parts[1])))?
                .with_timezone(&Utc)
        };

        if !parts[2].starts_with('P') {
            return Err(invalid(format!("period must start with 'P': {s:?}")));
        }
        let period = ScheduleDuration::parse(parts[2])?;

        Ok(Self {
            repeat,
            start_time,
            period,
        })
    }

    /// Fixed span between two runs.
    pub fn span(&self) -> Duration {
        self.period.to_duration()
    }
}

/// Canonical form with an explicit start time, so a stored schedule never
/// re-resolves "now" when it is loaded again.
impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start_time.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        match self.repeat {
            Repeat::Unbounded => write!(f, "R/{start}/{}", self.period),
            Repeat::Times(n) => write!(f, "R{n}/{start}/{}", self.period),
        }
    }
}

fn invalid(msg: String) -> SchedulerError {
    SchedulerError::InvalidFormat(msg)
}
