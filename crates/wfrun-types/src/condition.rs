//! Status condition records.
//!
//! A run status owns an explicit list of conditions keyed by type. Setting a
//! condition replaces the existing entry of the same type; reading a missing
//! type yields an `Unknown` condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type summarizing a run's overall state.
pub const WORKFLOW_RUN_CONDITION: &str = "WorkflowRun";

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single observed condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Equal ignoring the transition timestamp.
    pub fn equal(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Conditions owned by a status object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionedStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ConditionedStatus {
    /// Replace conditions by type.
    ///
    /// An existing entry with the same status keeps its transition time so
    /// repeated ticks do not churn the persisted record.
    pub fn set_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        for mut new in conditions {
            match self
                .conditions
                .iter_mut()
                .find(|c| c.condition_type == new.condition_type)
            {
                Some(existing) => {
                    if existing.equal(&new) {
                        continue;
                    }
                    if existing.status == new.status {
                        new.last_transition_time = existing.last_transition_time;
                    }
                    *existing = new;
                }
                None => self.conditions.push(new),
            }
        }
    }

    /// Condition of the given type, or an `Unknown` placeholder.
    pub fn get_condition(&self, condition_type: &str) -> Condition {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
            .cloned()
            .unwrap_or_else(|| Condition {
                condition_type: condition_type.to_string(),
                status: ConditionStatus::Unknown,
                reason: String::new(),
                message: String::new(),
                last_transition_time: DateTime::<Utc>::UNIX_EPOCH,
            })
    }
}
