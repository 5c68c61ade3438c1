//! Connection schedules and time-to-wait arithmetic

use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Wait used when scheduling is suspended (manual schedule, disabled
/// connection, tombstoned workspace)
pub const SUSPENDED_WAIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Source of wall-clock time for schedule arithmetic
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time that advances with the tokio clock
///
/// Anchored to the system time at creation. Under a paused runtime it moves
/// only when tokio time does, so schedules and timers stay in step.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            base: Utc::now(),
            started: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.started.elapsed())
            .ok()
            .and_then(|elapsed| self.base.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Unit of a basic schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

/// How often a connection syncs on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ConnectionSchedule {
    /// Only runs when asked to
    Manual,

    /// Every `units` `time_unit`s, measured from the last job start
    Basic { units: u32, time_unit: TimeUnit },
}

impl ConnectionSchedule {
    pub fn every(units: u32, time_unit: TimeUnit) -> Self {
        Self::Basic { units, time_unit }
    }

    /// Time of the next run after a job started at `last_start`
    ///
    /// `None` for manual schedules and for dates past the calendar range.
    pub fn next_run_after(&self, last_start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let Self::Basic { units, time_unit } = *self else {
            return None;
        };
        let units = i64::from(units);
        match time_unit {
            TimeUnit::Minutes => last_start.checked_add_signed(chrono::Duration::minutes(units)),
            TimeUnit::Hours => last_start.checked_add_signed(chrono::Duration::hours(units)),
            TimeUnit::Days => last_start.checked_add_signed(chrono::Duration::days(units)),
            TimeUnit::Weeks => last_start.checked_add_signed(chrono::Duration::weeks(units)),
            TimeUnit::Months => {
                let months = u32::try_from(units).ok()?;
                last_start.checked_add_months(Months::new(months))
            }
        }
    }

    /// Length of the interval that starts at `start`
    ///
    /// Month intervals vary with the calendar, hence the anchor.
    pub fn interval_after(&self, start: DateTime<Utc>) -> Option<Duration> {
        let next_run = self.next_run_after(start)?;
        (next_run - start).to_std().ok()
    }
}

/// Remaining wait before the next scheduled run
///
/// `max(0, T + I - now)` where `T` is the start of the last job that reached
/// a terminal state and `I` the schedule interval. A connection that never
/// ran is due immediately; a manual schedule never comes due.
pub fn compute_time_to_wait(
    schedule: &ConnectionSchedule,
    last_terminal_job_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    if matches!(schedule, ConnectionSchedule::Manual) {
        return SUSPENDED_WAIT;
    }

    let Some(last_start) = last_terminal_job_start else {
        return Duration::ZERO;
    };

    match schedule.next_run_after(last_start) {
        Some(next_run) => (next_run - now).to_std().unwrap_or(Duration::ZERO),
        None => SUSPENDED_WAIT,
    }
}
