//! Periodic job descriptions.

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::messenger::EMAIL_MESSENGER;

/// Longest accepted `every` interval: ten years.
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Every `secs` seconds, first run one period after start.
    Every { secs: u64 },
    /// Once a week on `day` at `at` (`HH:MM`, UTC).
    Weekly { day: Weekday, at: String },
}

impl JobSchedule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            JobSchedule::Every { secs } if *secs == 0 => Err("interval must be > 0".to_string()),
            JobSchedule::Every { secs } if *secs > MAX_INTERVAL_SECS => Err(format!(
                "interval must be <= {} seconds",
                MAX_INTERVAL_SECS
            )),
            JobSchedule::Every { .. } => Ok(()),
            JobSchedule::Weekly { at, .. } => parse_time(at).map(|_| ()),
        }
    }

    /// First run strictly after `now`. `None` for an invalid schedule or a
    /// time past what `DateTime` can represent.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Every { secs } if *secs > 0 => {
                let interval = TimeDelta::try_seconds(i64::try_from(*secs).ok()?)?;
                now.checked_add_signed(interval)
            }
            JobSchedule::Every { .. } => None,
            JobSchedule::Weekly { day, at } => {
                let time = parse_time(at).ok()?;
                let days_ahead = (7 + day.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let date = now
                    .date_naive()
                    .checked_add_signed(TimeDelta::try_days(i64::from(days_ahead))?)?;
                let candidate = date.and_time(time).and_utc();
                if candidate > now {
                    Some(candidate)
                } else {
                    candidate.checked_add_signed(TimeDelta::try_days(7)?)
                }
            }
        }
    }
}

fn parse_time(at: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(at, "%H:%M").map_err(|_| format!("`{}` is not HH:MM", at))
}

fn default_messenger() -> String {
    EMAIL_MESSENGER.to_string()
}

fn default_true() -> bool {
    true
}

/// A parametrized periodic campaign: on every run, `subject`/`body` go to
/// every active subscriber through `messenger`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobConfig {
    pub name: String,

    pub schedule: JobSchedule,

    #[serde(default = "default_messenger")]
    pub messenger: String,

    pub subject: String,

    pub body: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}
