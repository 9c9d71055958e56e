use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{ChaosError, ChaosResult};
use crate::experiment::ScheduleSpec;

/// Gate holding injection back until a cron expression first fires.
#[derive(Debug, Clone)]
pub struct CronGate {
    schedule: Schedule,
}

impl CronGate {
    /// Accepts 5-field expressions as well as the 6/7-field seconds form.
    pub fn parse(expr: &str) -> ChaosResult<Self> {
        let trimmed = expr.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| ChaosError::Validation(format!("invalid cron '{expr}': {e}")))?;
        Ok(Self { schedule })
    }

    /// First fire time strictly after `since`.
    pub fn first_fire_after(&self, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&since).next()
    }
}

/// When injection may begin for this schedule, or `None` for right away.
pub fn injection_not_before(
    schedule: Option<&ScheduleSpec>,
    since: DateTime<Utc>,
) -> ChaosResult<Option<DateTime<Utc>>> {
    let Some(schedule) = schedule else {
        return Ok(None);
    };
    if schedule.immediate {
        return Ok(None);
    }
    match schedule.cron.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(expr) => match CronGate::parse(expr)?.first_fire_after(since) {
            Some(at) => Ok(Some(at)),
            None => Err(ChaosError::Validation(format!(
                "cron '{expr}' never fires after {}",
                since.to_rfc3339()
            ))),
        },
        None => Ok(None),
    }
}
