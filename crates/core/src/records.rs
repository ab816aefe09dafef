//! Durable records owned by the content store. The engine reads them and
//! mutates only contact step membership, actions and passed-step records.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{JourneyError, JourneyResult};
use crate::types::{
    deserialize_timing, ChannelId, CompositionId, ConnectionId, ContactId, JourneyId, RuleId,
    StepId, StepKind, StepType, Timing,
};

/// Stored nulls become the type's default.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Score values arrive as numbers or numeric strings.
fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_f64().unwrap_or_default()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(serde::de::Error::custom),
        Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, got {other}"
        ))),
    }
}

/// A related record, populated only by its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub id: u64,
}

impl From<u64> for Reference {
    fn from(id: u64) -> Self {
        Self { id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: JourneyId,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub active: bool,
    /// Shallow steps: type and attached contacts only.
    #[serde(default, deserialize_with = "null_default")]
    pub journey_steps: Vec<JourneyStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyStep {
    pub id: StepId,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub journey: Option<Reference>,
    #[serde(default)]
    pub channel: Option<Reference>,
    #[serde(default)]
    pub composition: Option<Reference>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_timing"
    )]
    pub timing: Option<Timing>,
    /// Trigger-matching criteria on `trigger` steps.
    #[serde(default)]
    pub additional_data: Value,
    #[serde(default, deserialize_with = "null_default")]
    pub contacts: Vec<Reference>,
    /// Outgoing branches, sorted ascending by priority.
    #[serde(default, deserialize_with = "null_default")]
    pub connections_from_this_step: Vec<JourneyStepConnection>,
    #[serde(default, deserialize_with = "null_default")]
    pub connections_to_this_step: Vec<Reference>,
}

impl JourneyStep {
    /// Validates the per-type required relations.
    pub fn kind(&self) -> JourneyResult<StepKind> {
        Ok(match self.step_type {
            StepType::Channel => {
                let composition = self.composition.ok_or_else(|| {
                    JourneyError::config(format!("channel step {} has no composition", self.id))
                })?;
                let channel = self.channel.ok_or_else(|| {
                    JourneyError::config(format!("channel step {} has no channel", self.id))
                })?;
                StepKind::Channel {
                    composition: composition.id,
                    channel: channel.id,
                }
            }
            StepType::Wait => StepKind::Wait,
            StepType::SchedulerTrigger => StepKind::SchedulerTrigger,
            StepType::Trigger => StepKind::Trigger,
        })
    }

    pub fn has_connections(&self) -> bool {
        !self.connections_from_this_step.is_empty()
    }

    pub fn journey_id(&self) -> JourneyResult<JourneyId> {
        self.journey
            .map(|j| j.id)
            .ok_or_else(|| JourneyError::config(format!("step {} has no journey", self.id)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    #[default]
    All,
    Any,
}

/// Directed, prioritized, rule-guarded edge between two steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyStepConnection {
    pub id: ConnectionId,
    #[serde(default, deserialize_with = "null_default")]
    pub priority: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub condition_type: ConditionType,
    #[serde(default)]
    pub target_step: Option<Reference>,
    #[serde(default, deserialize_with = "null_default")]
    pub journey_step_rules: Vec<JourneyStepRule>,
}

impl JourneyStepConnection {
    pub fn target(&self) -> Option<StepId> {
        self.target_step.map(|t| t.id)
    }
}

/// One remotely evaluated predicate plus the score items it awards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JourneyStepRule {
    pub id: RuleId,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub condition_entity: Option<String>,
    #[serde(default)]
    pub condition_operator: Option<String>,
    #[serde(default)]
    pub condition_value: Option<String>,
    #[serde(default)]
    pub additional_condition: Option<String>,
    #[serde(default)]
    pub additional_data: Value,
    #[serde(default)]
    pub ready_condition: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub journey_step_rule_scores: Vec<RuleScore>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleScore {
    pub name: String,
    #[serde(deserialize_with = "lenient_number")]
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    #[serde(default, deserialize_with = "null_default")]
    pub journeys: Vec<Reference>,
    #[serde(default, deserialize_with = "null_default")]
    pub journey_steps: Vec<Reference>,
    #[serde(default, deserialize_with = "null_default")]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub channel: Option<Reference>,
    #[serde(default, deserialize_with = "null_default")]
    pub active: bool,
}

// ─── Writes issued by the engine ────────────────────────────────────────────

/// A `step_reached` action with the score earned on the way out of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    pub step: StepId,
    pub contact: ContactId,
    pub score: f64,
    pub score_items: Vec<RuleScore>,
    pub target_step: Option<StepId>,
}

impl StepAction {
    /// Terminal action for a step with no branch taken.
    pub fn terminal(step: StepId, contact: ContactId) -> Self {
        Self {
            step,
            contact,
            score: 0.0,
            score_items: Vec::new(),
            target_step: None,
        }
    }
}

/// Record that a contact went through a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassedStep {
    pub step: StepId,
    pub contact: ContactId,
    pub journey: JourneyId,
    pub composition: Option<CompositionId>,
    pub channel: Option<ChannelId>,
}

/// Previously recorded `step_reached` action for a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReached {
    pub target_step: Option<StepId>,
}

/// Request handed to the sender for one channel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub contact_id: ContactId,
    pub journey_id: JourneyId,
    pub step_id: StepId,
    pub composition_id: CompositionId,
    pub channel_id: ChannelId,
    pub ignore_subscription: bool,
}
