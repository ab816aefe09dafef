//! Webhook events delivered on the `trigger` queue and the criteria that
//! `trigger` steps store to select them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::records::JourneyStep;
use crate::types::ContactId;

/// Recognized webhook event labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLabel {
    #[serde(rename = "entry.create")]
    Create,
    #[serde(rename = "entry.update")]
    Update,
    #[serde(rename = "entry.delete")]
    Delete,
    #[serde(rename = "entry.unpublish")]
    Unpublish,
}

impl EventLabel {
    /// Normalizes a raw label; anything unrecognized yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "entry.create" => Some(Self::Create),
            "entry.update" => Some(Self::Update),
            "entry.delete" => Some(Self::Delete),
            "entry.unpublish" => Some(Self::Unpublish),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "entry.create",
            Self::Update => "entry.update",
            Self::Delete => "entry.delete",
            Self::Unpublish => "entry.unpublish",
        }
    }
}

/// Inbound content-store webhook. Only `model`, `event` and `entry` matter;
/// everything else is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub entry: Value,
}

impl WebhookEvent {
    pub fn label(&self) -> Option<EventLabel> {
        self.event.as_deref().and_then(EventLabel::parse)
    }

    /// The affected contact: the entry itself for `contact` events, otherwise
    /// the entry's related contact. `documentId` wins over `id` when numeric.
    pub fn contact_id(&self) -> Option<ContactId> {
        let model = self.model.as_deref().unwrap_or("-");
        let source = if model == "contact" {
            &self.entry
        } else {
            self.entry.get("contact")?
        };

        if let Some(document_id) = source.get("documentId") {
            if let Some(id) = numeric_id(document_id) {
                return Some(id);
            }
            warn!(model, document_id = %document_id, "Webhook documentId is not numeric, falling back to id");
        }
        let id = source.get("id").and_then(numeric_id);
        if id.is_none() {
            debug!(model, "Webhook carries no numeric contact id");
        }
        id
    }

    /// Current value of an entry attribute.
    pub fn attribute(&self, label: &str) -> Option<&Value> {
        self.entry.as_object()?.get(label)
    }
}

fn numeric_id(raw: &Value) -> Option<ContactId> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Optional attribute constraint on a trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMatch {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// Matching criteria stored in a trigger step's `additional_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerCriteria {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub attribute: Option<AttributeMatch>,
}

impl TriggerCriteria {
    /// Reads the criteria off a step; malformed data matches nothing.
    pub fn of(step: &JourneyStep) -> Self {
        serde_json::from_value(step.additional_data.clone()).unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled == Some(true)
    }

    pub fn label(&self) -> Option<EventLabel> {
        self.event.as_deref().and_then(EventLabel::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contact_resolution() {
        let direct = WebhookEvent {
            model: Some("contact".into()),
            event: Some("entry.update".into()),
            entry: json!({"documentId": 17}),
        };
        assert_eq!(direct.contact_id(), Some(17));

        let related = WebhookEvent {
            model: Some("donation".into()),
            event: Some("entry.create".into()),
            entry: json!({"contact": {"documentId": "23"}}),
        };
        assert_eq!(related.contact_id(), Some(23));

        let orphan = WebhookEvent {
            model: Some("donation".into()),
            event: Some("entry.create".into()),
            entry: json!({"amount": 5}),
        };
        assert_eq!(orphan.contact_id(), None);
    }

    #[test]
    fn test_non_numeric_document_id_falls_back_to_id() {
        let mut event = WebhookEvent {
            model: Some("donation".into()),
            event: Some("entry.create".into()),
            entry: json!({"contact": {"documentId": "h2k9x", "id": 31}}),
        };
        assert_eq!(event.contact_id(), Some(31));

        event.entry = json!({"contact": {"documentId": "h2k9x"}});
        assert_eq!(event.contact_id(), None);
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(EventLabel::parse("entry.unpublish"), Some(EventLabel::Unpublish));
        assert_eq!(EventLabel::parse("entry.publish"), None);
        assert_eq!(EventLabel::Create.as_str(), "entry.create");
    }

    #[test]
    fn test_malformed_criteria_is_disabled() {
        let step: JourneyStep = serde_json::from_value(json!({
            "id": 1,
            "type": "trigger",
            "additional_data": {"enabled": "yes", "entity": 3}
        }))
        .unwrap();
        assert!(!TriggerCriteria::of(&step).is_enabled());
    }
}
