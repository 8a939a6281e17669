use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::SchedulerError;

/// A parsed recurrence expression.
///
/// The grammar is the extended seconds–minute–hour–dom–month–dow form with
/// descriptor aliases: `@every <duration>` plus the classic `@hourly`-style
/// shorthands, which are rewritten to their field equivalents before parsing.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed interval after the reference instant.
    Every(Duration),
    /// Field expression, seconds-grained.
    Cron(Box<Schedule>),
}

impl Recurrence {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(SchedulerError::Schedule {
                expression: expression.to_string(),
                reason: "empty expression".to_string(),
            });
        }

        if let Some(rest) = expr.strip_prefix("@every ") {
            let interval =
                humantime::parse_duration(rest.trim()).map_err(|e| SchedulerError::Schedule {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                })?;
            if interval.is_zero() {
                return Err(SchedulerError::Schedule {
                    expression: expression.to_string(),
                    reason: "interval must be positive".to_string(),
                });
            }
            return Ok(Recurrence::Every(interval));
        }

        let fields = match expr {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * SUN",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            other => other,
        };

        let schedule = Schedule::from_str(fields).map_err(|e| SchedulerError::Schedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Recurrence::Cron(Box::new(schedule)))
    }

    /// The next fire instant strictly after `after`, or `None` if the
    /// expression has no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::Every(interval) => {
                let delta = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(delta)
            }
            Recurrence::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}
