//! Schedule definitions and next-fire evaluation
//!
//! A [`Schedule`] describes *when* a job runs: a 5-field cron expression
//! evaluated in a declared time zone, a fixed interval, once at supervisor
//! start ("reboot"), or once at a given instant. [`Schedule::next_after`]
//! computes the next fire instant; it is the only place the engine reasons
//! about calendars.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::util::to_chrono;

/// Errors raised while constructing or evaluating a schedule.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    /// Cron expression failed to parse.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    /// Cron expression did not have exactly five fields.
    ///
    /// Sub-minute granularity is deliberately unsupported; the sixth field
    /// of the underlying parser is always pinned to second zero.
    #[error("cron expression {0:?} must have 5 fields (minute hour day month weekday)")]
    WrongFieldCount(String),

    /// Unknown IANA time-zone name.
    #[error("invalid time zone: {0}")]
    InvalidTimezone(String),

    /// Interval of zero length.
    #[error("interval schedules require a non-zero period")]
    ZeroInterval,
}

/// When a job fires.
///
/// Exactly one kind per job. Cron expressions are stored as the normalized
/// text form; the parse is re-run at evaluation time, which keeps the value
/// serializable for any store backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// 5-field cron expression, evaluated in `tz`.
    Cron { expr: String, tz: Tz },

    /// Fires every `every`, measured from the previous fire.
    Interval {
        #[serde(with = "crate::util::duration_millis")]
        every: Duration,
    },

    /// Runs once when the supervisor starts; never schedules a next run.
    Reboot,

    /// Runs once. `None` means "as soon as registered".
    OneShot { at: Option<DateTime<Utc>> },
}

impl Schedule {
    /// Build a cron schedule from a 5-field expression or a named macro.
    ///
    /// Accepted macros: `@minutely`, `@hourly`, `@daily`, `@weekly`,
    /// `@monthly`, `@yearly`. Day-of-week names (`Mon`, `fri`) pass through
    /// to the parser. The expression is validated here; an invalid one
    /// never constructs a `Schedule`.
    pub fn cron(expr: &str, tz: &str) -> Result<Self, ScheduleError> {
        let tz: Tz = tz
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(tz.to_string()))?;
        let normalized = normalize_cron(expr)?;

        // Parse once up front so registration rejects bad expressions.
        cron::Schedule::from_str(&with_seconds(&normalized)).map_err(|e| {
            ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self::Cron {
            expr: normalized,
            tz,
        })
    }

    /// Build an interval schedule.
    pub fn interval(every: Duration) -> Result<Self, ScheduleError> {
        if every.is_zero() {
            return Err(ScheduleError::ZeroInterval);
        }
        Ok(Self::Interval { every })
    }

    /// Build a one-shot schedule firing at `at`.
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self::OneShot { at: Some(at) }
    }

    /// True for schedules that fire at supervisor start only.
    pub fn is_reboot(&self) -> bool {
        matches!(self, Self::Reboot)
    }

    /// True for interval schedules (which default to unique dispatch).
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::Interval { .. })
    }

    /// Earliest instant strictly after `from` at which this schedule fires.
    ///
    /// Cron fields are evaluated in the schedule's declared zone; the
    /// returned instant is UTC. Returns `Ok(None)` when the schedule will
    /// never fire again (reboot, or a one-shot whose instant has passed).
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Self::Cron { expr, tz } => {
                let schedule = cron::Schedule::from_str(&with_seconds(expr)).map_err(|e| {
                    ScheduleError::InvalidCron {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let zoned = from.with_timezone(tz);
                Ok(schedule
                    .after(&zoned)
                    .next()
                    .map(|next| next.with_timezone(&Utc)))
            }
            Self::Interval { every } => Ok(Some(from + to_chrono(*every))),
            Self::Reboot => Ok(None),
            Self::OneShot { at } => Ok(at.filter(|at| *at > from)),
        }
    }

    /// Instant to seed `next_run_at` with at registration time.
    ///
    /// One-shots with a past (or absent) instant become due immediately;
    /// everything else defers to [`Self::next_after`].
    pub fn first_run_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Self::OneShot { at } => Ok(Some(at.unwrap_or(now).max(now))),
            _ => self.next_after(now),
        }
    }
}

/// Expand macros and check the field count, returning the 5-field form.
fn normalize_cron(expr: &str) -> Result<String, ScheduleError> {
    let expr = expr.trim();
    let expanded = match expr.to_ascii_lowercase().as_str() {
        "@minutely" => "* * * * *",
        "@hourly" => "0 * * * *",
        "@daily" => "0 0 * * *",
        "@weekly" => "0 0 * * Sun",
        "@monthly" => "0 0 1 * *",
        "@yearly" => "0 0 1 1 *",
        _ => expr,
    };

    if expanded.split_whitespace().count() != 5 {
        return Err(ScheduleError::WrongFieldCount(expr.to_string()));
    }
    Ok(expanded.to_string())
}

/// The underlying parser wants a seconds field; pin it to zero.
fn with_seconds(five_field: &str) -> String {
    format!("0 {five_field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn cron_daily_next_fire() {
        let schedule = Schedule::cron("0 6 * * *", "UTC").unwrap();
        let next = schedule.next_after(utc("2025-01-10T05:59:59Z")).unwrap();
        assert_eq!(next, Some(utc("2025-01-10T06:00:00Z")));

        // After firing, the next run is tomorrow.
        let next = schedule.next_after(utc("2025-01-10T06:00:00Z")).unwrap();
        assert_eq!(next, Some(utc("2025-01-11T06:00:00Z")));
    }

    #[test]
    fn cron_respects_time_zone() {
        // 06:00 in New York is 11:00 UTC in January (EST, UTC-5).
        let schedule = Schedule::cron("0 6 * * *", "America/New_York").unwrap();
        let next = schedule.next_after(utc("2025-01-10T00:00:00Z")).unwrap();
        assert_eq!(next, Some(utc("2025-01-10T11:00:00Z")));
    }

    #[test]
    fn cron_lists_ranges_and_steps() {
        assert!(Schedule::cron("*/15 * * * *", "UTC").is_ok());
        assert!(Schedule::cron("0 9-17 * * 1-5", "UTC").is_ok());
        assert!(Schedule::cron("0 0 1,15 * *", "UTC").is_ok());
        assert!(Schedule::cron("30 4 * * Mon,Fri", "UTC").is_ok());
    }

    #[test]
    fn cron_macros_expand() {
        let schedule = Schedule::cron("@hourly", "UTC").unwrap();
        let next = schedule.next_after(utc("2025-03-01T10:30:00Z")).unwrap();
        assert_eq!(next, Some(utc("2025-03-01T11:00:00Z")));

        let schedule = Schedule::cron("@minutely", "UTC").unwrap();
        let next = schedule.next_after(utc("2025-03-01T10:30:10Z")).unwrap();
        assert_eq!(next, Some(utc("2025-03-01T10:31:00Z")));

        assert!(Schedule::cron("@daily", "UTC").is_ok());
        assert!(Schedule::cron("@weekly", "UTC").is_ok());
        assert!(Schedule::cron("@monthly", "UTC").is_ok());
        assert!(Schedule::cron("@yearly", "UTC").is_ok());
    }

    #[test]
    fn cron_rejects_wrong_field_count() {
        assert!(matches!(
            Schedule::cron("0 0 6 * * *", "UTC"),
            Err(ScheduleError::WrongFieldCount(_))
        ));
        assert!(matches!(
            Schedule::cron("6 * *", "UTC"),
            Err(ScheduleError::WrongFieldCount(_))
        ));
    }

    #[test]
    fn cron_rejects_garbage() {
        assert!(matches!(
            Schedule::cron("not a cron * *", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            Schedule::cron("0 6 * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn interval_adds_period() {
        let schedule = Schedule::interval(Duration::from_secs(300)).unwrap();
        let next = schedule.next_after(utc("2025-01-10T00:00:00Z")).unwrap();
        assert_eq!(next, Some(utc("2025-01-10T00:05:00Z")));
    }

    #[test]
    fn interval_rejects_zero() {
        assert!(matches!(
            Schedule::interval(Duration::ZERO),
            Err(ScheduleError::ZeroInterval)
        ));
    }

    #[test]
    fn reboot_never_schedules() {
        let next = Schedule::Reboot.next_after(utc("2025-01-10T00:00:00Z")).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn one_shot_fires_once() {
        let at = utc("2025-06-01T12:00:00Z");
        let schedule = Schedule::one_shot(at);

        let next = schedule.next_after(utc("2025-01-01T00:00:00Z")).unwrap();
        assert_eq!(next, Some(at));

        // Once the instant has passed there is no next run.
        let next = schedule.next_after(at).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn one_shot_in_past_is_due_immediately() {
        let now = utc("2025-06-01T12:00:00Z");
        let schedule = Schedule::one_shot(utc("2025-01-01T00:00:00Z"));
        assert_eq!(schedule.first_run_at(now).unwrap(), Some(now));
    }

    #[test]
    fn monotonic_next_fire() {
        // Property: next fire is always strictly after the probe instant.
        let schedule = Schedule::cron("*/5 * * * *", "UTC").unwrap();
        let mut t = utc("2025-01-01T00:00:00Z");
        for _ in 0..20 {
            let next = schedule.next_after(t).unwrap().unwrap();
            assert!(next > t);
            t = next;
        }
    }

    #[test]
    fn serde_round_trip() {
        let schedule = Schedule::cron("0 6 * * *", "America/New_York").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        let parsed: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(schedule, parsed);
    }
}
