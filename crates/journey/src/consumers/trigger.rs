//! Webhook-driven journey entry.
//!
//! Trigger steps never execute. A matching event launches a job for every
//! step the trigger connects to, with subscription checks disabled.

use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::Queue;
use journey_core::event_bus::JourneyEventKind;
use journey_core::webhook::{AttributeMatch, TriggerCriteria, WebhookEvent};
use journey_core::JourneyResult;
use serde_json::{Number, Value};
use tracing::{info, warn};

use super::Consumer;
use crate::engine::JourneyEngine;
use crate::types::{Handled, NewJob, StepRef};

pub struct TriggerConsumer {
    engine: Arc<JourneyEngine>,
}

impl TriggerConsumer {
    pub fn new(engine: Arc<JourneyEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Consumer for TriggerConsumer {
    type Message = WebhookEvent;

    fn queue(&self) -> Queue {
        Queue::Trigger
    }

    fn job_id(message: &WebhookEvent) -> String {
        format!(
            "{}:{}",
            message.model.as_deref().unwrap_or("-"),
            message.event.as_deref().unwrap_or("-")
        )
    }

    async fn process(&self, event: WebhookEvent) -> JourneyResult<Handled> {
        info!(
            model = event.model.as_deref().unwrap_or("-"),
            event = event.event.as_deref().unwrap_or("-"),
            "Finding trigger steps"
        );
        let Some(contact) = event.contact_id() else {
            warn!("No contact in webhook event");
            return Ok(Handled::Skipped {
                reason: "no contact",
            });
        };

        let store = self.engine.store();
        let matched: Vec<_> = store
            .find_trigger_steps()
            .await?
            .into_iter()
            .filter(|step| matches(&TriggerCriteria::of(step), &event))
            .collect();
        if matched.is_empty() {
            return Ok(Handled::Triggered { steps: 0, jobs: 0 });
        }

        // Every launched step is resolved before anything is written or published.
        let mut launches = Vec::new();
        for step in &matched {
            let journey = step.journey_id()?;
            for target in step.connections_from_this_step.iter().filter_map(|c| c.target()) {
                let next = store.get_journey_step(target).await?;
                launches.push(NewJob::for_step(contact, journey, &next)?.ignoring_subscription());
            }
        }

        let channel = &self.engine.settings().default_channel;
        if store.ensure_subscription(contact, channel).await? {
            info!(contact_id = contact, channel = %channel, "Subscription created");
        }

        let jobs = launches.len();
        for job in launches {
            self.engine.dispatcher().create_job(job).await?;
        }
        for step in &matched {
            let journey = step.journey_id()?;
            self.engine.emit(
                JourneyEventKind::TriggerMatched,
                StepRef {
                    contact,
                    journey,
                    step: step.id,
                },
                None,
            );
        }

        metrics::counter!("journey.trigger.matched").increment(matched.len() as u64);
        info!(contact_id = contact, steps = matched.len(), jobs, "Trigger steps matched");
        Ok(Handled::Triggered {
            steps: matched.len(),
            jobs,
        })
    }
}

/// Whether a trigger step's criteria select `event`.
pub fn matches(criteria: &TriggerCriteria, event: &WebhookEvent) -> bool {
    if !criteria.is_enabled() || criteria.entity.is_none() || criteria.entity != event.model {
        return false;
    }
    match (criteria.label(), event.label()) {
        (Some(expected), Some(actual)) if expected == actual => {}
        _ => return false,
    }
    match &criteria.attribute {
        Some(AttributeMatch {
            label: Some(label),
            value,
        }) if !label.is_empty() => attribute_matches(value, event.attribute(label)),
        _ => true,
    }
}

/// Compares an entry attribute against the expected value the way the
/// journey builder stores it: booleans by truthiness, numbers (or an
/// object's `id`) numerically, anything else by its string form.
fn attribute_matches(expected: &Value, actual: Option<&Value>) -> bool {
    let expected_bool = match expected {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    };
    if let Some(expected) = expected_bool {
        return truthy(actual) == expected;
    }

    if let Value::Number(expected) = expected {
        let actual = match actual {
            Some(Value::Object(map)) if truthy(map.get("id")) => map.get("id"),
            other => other,
        };
        return match (to_number(actual), expected.as_f64()) {
            (Some(a), Some(e)) => a == e,
            _ => false,
        };
    }

    to_string(actual) == to_string(Some(expected))
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// `None` stands for NaN.
fn to_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn to_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => number_string(n),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => to_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

// Integral floats print without a fraction: 5.0 -> "5".
fn number_string(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < 1e21 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn criteria(raw: Value) -> TriggerCriteria {
        serde_json::from_value(raw).unwrap()
    }

    fn event(model: &str, label: &str, entry: Value) -> WebhookEvent {
        WebhookEvent {
            model: Some(model.into()),
            event: Some(label.into()),
            entry,
        }
    }

    #[test]
    fn test_entity_and_event_must_match() {
        let c = criteria(json!({"enabled": true, "entity": "contact", "event": "entry.create"}));
        assert!(matches(&c, &event("contact", "entry.create", json!({}))));
        assert!(!matches(&c, &event("contact", "entry.update", json!({}))));
        assert!(!matches(&c, &event("donation", "entry.create", json!({}))));
    }

    #[test]
    fn test_disabled_or_unknown_label_never_matches() {
        let disabled = criteria(json!({"enabled": false, "entity": "contact", "event": "entry.create"}));
        assert!(!matches(&disabled, &event("contact", "entry.create", json!({}))));

        let c = criteria(json!({"enabled": true, "entity": "contact", "event": "entry.publish"}));
        assert!(!matches(&c, &event("contact", "entry.publish", json!({}))));
    }

    #[test]
    fn test_boolean_attribute_uses_truthiness() {
        let c = criteria(json!({
            "enabled": true, "entity": "contact", "event": "entry.update",
            "attribute": {"label": "newsletter", "value": "true"}
        }));
        assert!(matches(&c, &event("contact", "entry.update", json!({"newsletter": 1}))));
        assert!(!matches(&c, &event("contact", "entry.update", json!({"newsletter": ""}))));
        assert!(!matches(&c, &event("contact", "entry.update", json!({}))));
    }

    #[test]
    fn test_numeric_attribute_reads_relation_id() {
        let c = criteria(json!({
            "enabled": true, "entity": "donation", "event": "entry.create",
            "attribute": {"label": "campaign", "value": 12}
        }));
        assert!(matches(&c, &event("donation", "entry.create", json!({"campaign": {"id": 12}}))));
        assert!(matches(&c, &event("donation", "entry.create", json!({"campaign": "12"}))));
        assert!(!matches(&c, &event("donation", "entry.create", json!({"campaign": {"id": 13}}))));
        assert!(!matches(&c, &event("donation", "entry.create", json!({}))));
    }

    #[test]
    fn test_string_attribute_compares_string_forms() {
        let c = criteria(json!({
            "enabled": true, "entity": "contact", "event": "entry.update",
            "attribute": {"label": "country", "value": "CH"}
        }));
        assert!(matches(&c, &event("contact", "entry.update", json!({"country": "CH"}))));
        assert!(!matches(&c, &event("contact", "entry.update", json!({"country": "DE"}))));

        let amount = criteria(json!({
            "enabled": true, "entity": "donation", "event": "entry.create",
            "attribute": {"label": "amount", "value": "50"}
        }));
        assert!(matches(&amount, &event("donation", "entry.create", json!({"amount": 50}))));
        assert!(matches(&amount, &event("donation", "entry.create", json!({"amount": 50.0}))));
    }

    #[test]
    fn test_empty_attribute_label_is_ignored() {
        let c = criteria(json!({
            "enabled": true, "entity": "contact", "event": "entry.delete",
            "attribute": {"label": "", "value": "x"}
        }));
        assert!(matches(&c, &event("contact", "entry.delete", json!({}))));
    }
}
