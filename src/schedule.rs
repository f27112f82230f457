// Schedule - five-field cron expressions evaluated as pure functions of time

use crate::{BackupError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Searching further than this many days means the expression never fires
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// One field of a cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: BTreeSet<u32>,
    /// Written as `*` (or `*/1`); matters for the day-of-month/day-of-week rule
    wildcard: bool,
}

impl Field {
    fn parse(text: &str, name: &str, min: u32, max: u32) -> Result<Self> {
        let invalid = |why: &str| BackupError::Schedule(format!("{} field '{}': {}", name, text, why));
        let mut values = BTreeSet::new();
        let mut wildcard = false;

        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                    if step == 0 {
                        return Err(invalid("step must be positive"));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range == "*" {
                if step == 1 {
                    wildcard = true;
                }
                (min, max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                let lo: u32 = lo.parse().map_err(|_| invalid("bad range start"))?;
                let hi: u32 = hi.parse().map_err(|_| invalid("bad range end"))?;
                (lo, hi)
            } else {
                let value: u32 = range.parse().map_err(|_| invalid("not a number"))?;
                // `5/15` means from 5 to the end in steps of 15
                if part.contains('/') {
                    (value, max)
                } else {
                    (value, value)
                }
            };

            if lo < min || hi > max || lo > hi {
                return Err(invalid(&format!("out of range {}-{}", min, max)));
            }
            values.extend((lo..=hi).step_by(step as usize));
        }

        Ok(Self { values, wildcard })
    }

    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

/// A parsed `minute hour day-of-month month day-of-week` expression (UTC).
///
/// When both day fields are restricted a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(BackupError::Schedule(format!(
                "expected 5 fields in '{}', found {}",
                expr,
                parts.len()
            )));
        }

        let mut days_of_week = Field::parse(parts[4], "day-of-week", 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week.values.remove(&7) {
            days_of_week.values.insert(0);
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: Field::parse(parts[0], "minute", 0, 59)?,
            hours: Field::parse(parts[1], "hour", 0, 23)?,
            days_of_month: Field::parse(parts[2], "day-of-month", 1, 31)?,
            months: Field::parse(parts[3], "month", 1, 12)?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.wildcard, self.days_of_week.wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    /// First time of day at or after `from` that matches the time fields
    fn first_time_on(&self, (from_hour, from_minute): (u32, u32)) -> Option<NaiveTime> {
        for &hour in self.hours.values.range(from_hour..) {
            let first_minute = if hour == from_hour { from_minute } else { 0 };
            if let Some(&minute) = self.minutes.values.range(first_minute..).next() {
                return NaiveTime::from_hms_opt(hour, minute, 0);
            }
        }
        None
    }

    /// The first matching minute strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);

        let mut date = start.date_naive();
        let mut from = (start.hour(), start.minute());
        for _ in 0..SEARCH_HORIZON_DAYS {
            if self.matches_date(date) {
                if let Some(time) = self.first_time_on(from) {
                    return Ok(Utc.from_utc_datetime(&date.and_time(time)));
                }
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
            from = (0, 0);
        }

        Err(BackupError::Schedule(format!("'{}' never fires", self.source)))
    }

    /// The next `count` firing times after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        for _ in 0..count {
            cursor = self.next_after(cursor)?;
            times.push(cursor);
        }
        Ok(times)
    }
}

impl FromStr for CronExpr {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Periodic task the scheduler can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTask {
    FullBackup,
    IncrementalBackup,
    Prune,
}

impl ScheduledTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledTask::FullBackup => "full_backup",
            ScheduledTask::IncrementalBackup => "incremental_backup",
            ScheduledTask::Prune => "prune",
        }
    }
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cron expressions per task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Weekly, Sunday 02:00
    pub full_backup: String,
    /// Every six hours
    pub incremental_backup: String,
    /// Weekly, Sunday 03:00
    pub prune: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_backup: "0 2 * * 0".to_string(),
            incremental_backup: "0 */6 * * *".to_string(),
            prune: "0 3 * * 0".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn expression(&self, task: ScheduledTask) -> &str {
        match task {
            ScheduledTask::FullBackup => &self.full_backup,
            ScheduledTask::IncrementalBackup => &self.incremental_backup,
            ScheduledTask::Prune => &self.prune,
        }
    }

    /// Parse every expression, failing on the first invalid one
    pub fn parsed(&self) -> Result<Vec<(ScheduledTask, CronExpr)>> {
        [
            ScheduledTask::FullBackup,
            ScheduledTask::IncrementalBackup,
            ScheduledTask::Prune,
        ]
        .into_iter()
        .map(|task| Ok((task, CronExpr::parse(self.expression(task))?)))
        .collect()
    }
}

/// A task and the time it next fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub task: ScheduledTask,
    pub at: DateTime<Utc>,
}

/// The next `count` invocations across all tasks after `now`, in time order.
///
/// Ties keep task order: full backup, incremental backup, prune.
pub fn describe_next_invocations(
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
    count: usize,
) -> Result<Vec<Invocation>> {
    let mut invocations = Vec::new();
    for (task, expr) in schedule.parsed()? {
        invocations.extend(
            expr.upcoming(now, count)?
                .into_iter()
                .map(|at| Invocation { task, at }),
        );
    }
    // Stable sort keeps task order for equal instants
    invocations.sort_by_key(|i| i.at);
    invocations.truncate(count);
    Ok(invocations)
}
