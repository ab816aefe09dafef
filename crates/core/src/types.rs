//! Units of work carried on the broker: job messages, their timing, and the
//! journey-scan jobs and markers produced by the scheduler.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub type ContactId = u64;
pub type JourneyId = u64;
pub type StepId = u64;
pub type ConnectionId = u64;
pub type RuleId = u64;
pub type CompositionId = u64;
pub type ChannelId = u64;

/// Idempotency key for one contact/journey/step unit of work.
pub fn job_key(contact: ContactId, journey: JourneyId, step: StepId) -> String {
    format!("job-contact:{contact}-journey:{journey}-step:{step}")
}

/// Key of the rule-check message derived from a job key. This is a separate
/// logical message, not a retry of the parent job.
pub fn rule_check_key(job_key: &str) -> String {
    format!("{job_key}-rule_check:true")
}

/// Key under which the scheduler keeps the scan marker of a journey.
pub fn scan_marker_key(journey: JourneyId) -> String {
    format!("journey-job:{journey}")
}

// ─── Timing ─────────────────────────────────────────────────────────────────

/// When a step should fire relative to its dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Timing {
    /// Relative delay in minutes.
    Delay(f64),
    /// Absolute publication time.
    Publish(DateTime<Utc>),
}

impl Timing {
    /// Delay to apply when publishing at `now`. Past publication times clamp to zero.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Timing::Delay(minutes) => {
                let millis = (minutes * 60_000.0).max(0.0).round();
                Duration::from_millis(millis as u64)
            }
            Timing::Publish(at) => (*at - now).to_std().unwrap_or(Duration::ZERO),
        }
    }

    /// Interprets a stored `{type, value}` pair. An empty, null or zero value
    /// means the step has no timing and fires immediately.
    pub fn from_parts(kind: Option<&str>, value: &Value) -> Result<Option<Timing>, String> {
        match value {
            Value::Null | Value::Bool(false) => return Ok(None),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::Number(n) if n.as_f64() == Some(0.0) => return Ok(None),
            _ => {}
        }

        if kind == Some("delay") {
            let minutes = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("invalid delay value: {value}"))?;
            return Ok(Some(Timing::Delay(minutes)));
        }

        let at = match value {
            Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            Value::String(s) => parse_timestamp(s.trim()),
            _ => None,
        }
        .ok_or_else(|| format!("invalid publish timestamp: {value}"))?;
        Ok(Some(Timing::Publish(at)))
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
struct RawTiming {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    value: Value,
}

/// Deserializes an optional timing the way journey authors store it: numeric
/// strings, zone-less timestamps and empty values are all accepted.
pub fn deserialize_timing<'de, D>(deserializer: D) -> Result<Option<Timing>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let raw: RawTiming = serde_json::from_value(raw).map_err(D::Error::custom)?;
    Timing::from_parts(raw.kind.as_deref(), &raw.value).map_err(D::Error::custom)
}

// ─── Step kinds ─────────────────────────────────────────────────────────────

/// Step type as stored on a journey step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    Channel,
    Wait,
    SchedulerTrigger,
    Trigger,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Channel => "channel",
            StepType::Wait => "wait",
            StepType::SchedulerTrigger => "scheduler-trigger",
            StepType::Trigger => "trigger",
        }
    }

    /// Steps that gate purely on time and never evaluate branch rules.
    pub fn is_timed_gate(&self) -> bool {
        matches!(self, StepType::Wait | StepType::SchedulerTrigger)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated step kind carried by a job. A channel step always names the
/// composition and channel it sends; the other kinds carry nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepKind {
    Channel {
        #[serde(rename = "compositionId")]
        composition: CompositionId,
        channel: ChannelId,
    },
    Wait,
    SchedulerTrigger,
    Trigger,
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Channel { .. } => StepType::Channel,
            StepKind::Wait => StepType::Wait,
            StepKind::SchedulerTrigger => StepType::SchedulerTrigger,
            StepKind::Trigger => StepType::Trigger,
        }
    }

    pub fn composition(&self) -> Option<CompositionId> {
        match self {
            StepKind::Channel { composition, .. } => Some(*composition),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            StepKind::Channel { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

// ─── Job message ────────────────────────────────────────────────────────────

/// Payload of the `job`, `delayed` and `ruleCheck` queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: String,
    pub contact_id: ContactId,
    pub journey_id: JourneyId,
    pub step_id: StepId,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_timing"
    )]
    pub timing: Option<Timing>,
    #[serde(default)]
    pub rule_check: bool,
    #[serde(default)]
    pub ignore_subscription: bool,
    /// Number of times this rule check has been deferred.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl JobMessage {
    /// Broker message id used for duplicate suppression.
    pub fn idempotency_key(&self) -> String {
        if self.rule_check {
            rule_check_key(&self.job_id)
        } else {
            self.job_id.clone()
        }
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

// ─── Journey scan ───────────────────────────────────────────────────────────

/// Payload of the `journey` queue: scan one active journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub journey_id: JourneyId,
    pub job_key: String,
    pub created_at: DateTime<Utc>,
}

/// Short-lived marker that suppresses a new scan of a journey while the
/// previous one is still fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanMarker {
    pub journey_id: JourneyId,
    pub job_key: String,
    pub processed_date: DateTime<Utc>,
}

impl ScanMarker {
    /// A marker stays fresh while `now - processed_date < window`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.processed_date).to_std() {
            Ok(elapsed) => elapsed < window,
            // Processed "in the future" (clock skew between ticks): still fresh.
            Err(_) => true,
        }
    }
}
