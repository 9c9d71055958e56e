use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ChaosError, ChaosResult};
use crate::experiment::{
    ChaosExperimentStatus, ExperimentPhase, TargetResourceRecord, TargetState,
};

pub const CONDITION_CHAOS_INJECTED: &str = "ChaosInjected";
pub const CONDITION_CHAOS_REMOVED: &str = "ChaosRemoved";
pub const CONDITION_TARGETS_RESOLVED: &str = "TargetsResolved";
pub const CONDITION_SAFETY_VIOLATED: &str = "SafetyViolated";
pub const CONDITION_WAITING_FOR_SCHEDULE: &str = "WaitingForSchedule";

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            last_transition_time: now,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

impl ChaosExperimentStatus {
    /// Move to `to`, refusing anything that is not a forward transition.
    pub fn transition(&mut self, to: ExperimentPhase) -> ChaosResult<()> {
        if !ExperimentPhase::can_transition(self.phase, to) {
            return Err(ChaosError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = Some(to);
        Ok(())
    }

    /// Terminal failure: phase, reason and end time land in one write.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> ChaosResult<()> {
        self.transition(ExperimentPhase::Failed)?;
        self.failure_reason = Some(reason.into());
        self.end_time = Some(now);
        Ok(())
    }

    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn latest_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().rev().find(|c| c.type_ == type_)
    }

    /// When chaos went in, which is where the chaos window is measured from.
    pub fn injected_at(&self) -> Option<DateTime<Utc>> {
        self.latest_condition(CONDITION_CHAOS_INJECTED)
            .map(|c| c.last_transition_time)
            .or(self.start_time)
    }

    pub fn mark_targets(&mut self, state: TargetState) {
        for record in &mut self.target_resources {
            record.status = Some(state);
        }
    }

    pub fn set_targets(&mut self, targets: Vec<TargetResourceRecord>) {
        self.target_resources = targets;
    }
}
