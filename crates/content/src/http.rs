//! Content store over the headless CMS REST API.
//!
//! Every response is wrapped as `{ "data": ..., "meta": { "pagination": ... } }`.
//! Relations are only returned when explicitly populated, and a token with
//! too narrow permissions silently drops them, so populated step records are
//! validated before use.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use journey_core::config::ContentConfig;
use journey_core::records::{
    Contact, Journey, JourneyStep, PassedStep, StepAction, StepReached,
};
use journey_core::types::{CompositionId, ContactId, JourneyId, StepId};
use journey_core::{JourneyError, JourneyResult};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::store::ContentStore;

const PAGE_SIZE: u64 = 100;
const MAX_PAGES: u64 = 10_000;

const STEP_REACHED: &str = "step_reached";
const JOURNEY_FINISHED: &str = "journey_finished";

type Params = Vec<(String, String)>;

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn content_err(context: &str, err: reqwest::Error) -> JourneyError {
    JourneyError::Content(format!("{context}: {err}"))
}

/// Relations that must be present on a step fetched with populate.
const STEP_RELATIONS: [&str; 5] = [
    "contacts",
    "channel",
    "composition",
    "identity",
    "connections_from_this_step",
];

fn populated_step_params(id: StepId) -> Params {
    vec![
        param("filters[id][$eq]", id),
        param("populate[contacts]", true),
        param("populate[channel]", true),
        param("populate[composition]", true),
        param("populate[journey]", true),
        param("populate[identity]", true),
        param("populate[connections_from_this_step][sort][0]", "priority:asc"),
        param(
            "populate[connections_from_this_step][populate][journey_step_rules][populate][journey_step_rule_scores]",
            true,
        ),
        param("populate[connections_from_this_step][populate][target_step]", true),
    ]
}

/// Checks that the populated relations of a step were actually returned.
/// An absent key (as opposed to null or empty) means the API token cannot
/// read that relation.
pub fn validate_populated_step(raw: &Value) -> JourneyResult<()> {
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let missing = |relation: &str| {
        JourneyError::config(format!(
            "content API token badly configured for journey step {id} ({relation})"
        ))
    };

    for relation in STEP_RELATIONS {
        if raw.get(relation).is_none() {
            return Err(missing(relation));
        }
    }

    let first_connection = raw
        .get("connections_from_this_step")
        .and_then(Value::as_array)
        .and_then(|c| c.first());
    if let Some(connection) = first_connection {
        let rules = connection
            .get("journey_step_rules")
            .ok_or_else(|| missing("journey_step_rules"))?;
        if let Some(rule) = rules.as_array().and_then(|r| r.first()) {
            if rule.get("journey_step_rule_scores").is_none() {
                return Err(missing("journey_step_rule_scores"));
            }
        }
    }
    Ok(())
}

/// `target_step` inside an action payload. The payload may be stored as a
/// JSON string or an object, and the id as a number or numeric string.
pub fn payload_target_step(payload: &Value) -> JourneyResult<Option<StepId>> {
    let parsed;
    let object = match payload {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s)?;
            &parsed
        }
        other => other,
    };
    Ok(match object.get("target_step") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Object(o)) => o.get("id").and_then(Value::as_u64),
        _ => None,
    })
}

/// Id of a freshly created record. A create that answers without one cannot
/// be linked from the parent record.
fn created_id(created: &Value, what: &str) -> JourneyResult<Value> {
    match created.get("id") {
        Some(id) if !id.is_null() => Ok(id.clone()),
        _ => Err(JourneyError::Content(format!("{what} created without id"))),
    }
}

fn document_id(raw: &Value) -> Option<String> {
    match raw.get("documentId") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => raw.get("id").and_then(Value::as_u64).map(|id| id.to_string()),
    }
}

pub struct HttpContentStore {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpContentStore {
    pub fn new(config: &ContentConfig) -> JourneyResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| content_err("building HTTP client", e))?;

        info!(base_url = %config.base_url, "Content store client ready");

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.base_url, endpoint)
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        body: Option<Value>,
    ) -> JourneyResult<Value> {
        let context = format!("{method} {endpoint}");
        let mut request = self
            .http
            .request(method, self.url(endpoint))
            .bearer_auth(&self.token)
            .query(params);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| content_err(&context, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            metrics::counter!("content.request.errors").increment(1);
            return Err(JourneyError::Content(format!("{context} returned {status}: {text}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| content_err(&context, e))
    }

    /// Follows pagination until every page has been read.
    async fn find_all(&self, endpoint: &str, params: Params) -> JourneyResult<Vec<Value>> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let mut paged = params.clone();
            paged.push(param("pagination[page]", page));
            paged.push(param("pagination[pageSize]", PAGE_SIZE));

            let body = self.request(Method::GET, endpoint, &paged, None).await?;
            let data = match body.get("data") {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    return Err(JourneyError::Content(format!(
                        "GET {endpoint} returned no data array"
                    )))
                }
            };
            let received = data.len() as u64;
            all.extend(data);

            let page_count = body
                .pointer("/meta/pagination/pageCount")
                .and_then(Value::as_u64);
            let last = match page_count {
                Some(count) => page >= count,
                None => received < PAGE_SIZE,
            };
            if last || received == 0 || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }
        debug!(endpoint, count = all.len(), "Fetched collection");
        Ok(all)
    }

    async fn find_first(&self, endpoint: &str, mut params: Params) -> JourneyResult<Option<Value>> {
        params.push(param("pagination[pageSize]", 1));
        let body = self.request(Method::GET, endpoint, &params, None).await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned())
    }

    async fn find_by_id(
        &self,
        endpoint: &str,
        entity: &'static str,
        id: u64,
        mut params: Params,
    ) -> JourneyResult<Value> {
        params.insert(0, param("filters[id][$eq]", id));
        self.find_first(endpoint, params)
            .await?
            .ok_or(JourneyError::NotFound { entity, id })
    }

    async fn create(&self, endpoint: &str, mut data: Value) -> JourneyResult<Value> {
        if let Value::Object(map) = &mut data {
            map.insert("publishedAt".into(), json!(Utc::now()));
        }
        let body = self
            .request(Method::POST, endpoint, &[], Some(json!({ "data": data })))
            .await?;
        body.get("data").cloned().ok_or_else(|| {
            JourneyError::Content(format!("POST {endpoint} returned no created record"))
        })
    }

    fn decode<T: DeserializeOwned>(raw: Value) -> JourneyResult<T> {
        Ok(serde_json::from_value(raw)?)
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn get_journey(&self, id: JourneyId) -> JourneyResult<Journey> {
        let raw = self
            .find_by_id(
                "journeys",
                "journey",
                id,
                vec![param("populate[journey_steps][populate][contacts]", true)],
            )
            .await?;
        Self::decode(raw)
    }

    async fn list_active_journeys(&self) -> JourneyResult<Vec<Journey>> {
        let raw = self
            .find_all("journeys", vec![param("filters[active][$eq]", true)])
            .await?;
        raw.into_iter().map(Self::decode).collect()
    }

    async fn get_journey_step(&self, id: StepId) -> JourneyResult<JourneyStep> {
        let raw = self
            .find_first("journey-steps", populated_step_params(id))
            .await?
            .ok_or(JourneyError::NotFound {
                entity: "journey step",
                id,
            })?;
        validate_populated_step(&raw)?;

        let mut step: JourneyStep = Self::decode(raw)?;
        // Stable: equal priorities keep the API order.
        step.connections_from_this_step.sort_by_key(|c| c.priority);
        Ok(step)
    }

    async fn find_trigger_steps(&self) -> JourneyResult<Vec<JourneyStep>> {
        let raw = self
            .find_all(
                "journey-steps",
                vec![
                    param("filters[type][$eq]", "trigger"),
                    param("filters[journey][active][$eq]", true),
                    param("populate[journey]", true),
                    param("populate[connections_from_this_step][populate][target_step]", true),
                ],
            )
            .await?;
        raw.into_iter().map(Self::decode).collect()
    }

    async fn get_contact(&self, id: ContactId) -> JourneyResult<Contact> {
        let raw = self
            .find_by_id(
                "contacts",
                "contact",
                id,
                vec![
                    param("populate[journeys]", true),
                    param("populate[journey_steps]", true),
                    param("populate[subscriptions][populate][channel]", true),
                ],
            )
            .await?;
        Self::decode(raw)
    }

    async fn pass_contact_to_next_step(
        &self,
        contact: ContactId,
        current: StepId,
        journey: JourneyId,
        next: Option<StepId>,
    ) -> JourneyResult<()> {
        let raw = self.find_by_id("contacts", "contact", contact, Vec::new()).await?;
        let doc = document_id(&raw).ok_or_else(|| {
            JourneyError::Content(format!("contact {contact} has no document id"))
        })?;

        let update = match next {
            Some(next) => json!({
                "journey_steps": { "connect": [next], "disconnect": [current] }
            }),
            None => json!({
                "journey_steps": { "disconnect": [current] },
                "journeys": { "disconnect": [journey] }
            }),
        };
        self.request(
            Method::PUT,
            &format!("contacts/{doc}"),
            &[],
            Some(json!({ "data": update })),
        )
        .await?;

        debug!(
            contact_id = contact,
            journey_id = journey,
            from_step = current,
            to_step = ?next,
            "Contact step membership updated"
        );
        Ok(())
    }

    async fn create_action(&self, action: &StepAction) -> JourneyResult<()> {
        let mut score_item_ids = Vec::with_capacity(action.score_items.len());
        for item in &action.score_items {
            let created = self
                .create(
                    "action-score-items",
                    json!({ "name": item.name, "value": item.value }),
                )
                .await?;
            score_item_ids.push(created_id(&created, "score item")?);
        }

        let value = action.score.to_string();
        let payload = json!({
            "action_type": STEP_REACHED,
            "entity": "journey_steps",
            "value": value,
            "external_id": action.step.to_string(),
            "source": "journey_step",
            "contact": action.contact,
            "score_items": score_item_ids,
            "journey_step": action.step,
            "target_step": action.target_step,
        });
        self.create(
            "actions",
            json!({
                "action_type": STEP_REACHED,
                "entity": "journey_steps",
                "value": value,
                "external_id": action.step.to_string(),
                "source": "journey_step",
                "contact": action.contact,
                "score_items": { "set": score_item_ids },
                "journey_step": action.step,
                "payload": payload.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_finish_action(
        &self,
        contact: ContactId,
        journey: JourneyId,
    ) -> JourneyResult<()> {
        self.create(
            "actions",
            json!({
                "action_type": JOURNEY_FINISHED,
                "entity": "journeys",
                "value": "0",
                "external_id": journey.to_string(),
                "source": "journey",
                "contact": contact,
                "payload": json!({ "journey": journey, "contact": contact }).to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn add_passed_step(&self, passed: &PassedStep) -> JourneyResult<()> {
        self.create(
            "journey-passed-steps",
            json!({
                "journey_step": passed.step,
                "contact": passed.contact,
                "journey": passed.journey,
                "composition": passed.composition,
                "channel": passed.channel,
            }),
        )
        .await?;
        Ok(())
    }

    async fn has_passed_step(
        &self,
        step: StepId,
        contact: ContactId,
        composition: CompositionId,
    ) -> JourneyResult<bool> {
        let found = self
            .find_first(
                "journey-passed-steps",
                vec![
                    param("filters[journey_step][id][$eq]", step),
                    param("filters[composition][id][$eq]", composition),
                    param("filters[contact][id][$eq]", contact),
                ],
            )
            .await?;
        Ok(found.is_some())
    }

    async fn find_step_reached(
        &self,
        step: StepId,
        contact: ContactId,
    ) -> JourneyResult<Option<StepReached>> {
        let found = self
            .find_first(
                "actions",
                vec![
                    param("filters[action_type][$eq]", STEP_REACHED),
                    param("filters[external_id][$eq]", step),
                    param("filters[contact][id][$eq]", contact),
                    param("sort[0]", "createdAt:desc"),
                ],
            )
            .await?;

        match found {
            Some(action) => {
                let payload = action.get("payload").cloned().unwrap_or(Value::Null);
                let target_step = payload_target_step(&payload)?;
                Ok(Some(StepReached { target_step }))
            }
            None => Ok(None),
        }
    }

    async fn ensure_subscription(
        &self,
        contact: ContactId,
        channel_name: &str,
    ) -> JourneyResult<bool> {
        let Some(channel) = self
            .find_first("channels", vec![param("filters[name][$eqi]", channel_name)])
            .await?
        else {
            warn!(channel = channel_name, "Subscription channel not found");
            return Ok(false);
        };
        let channel_id = channel.get("id").and_then(Value::as_u64).ok_or_else(|| {
            JourneyError::Content(format!("channel {channel_name} has no id"))
        })?;

        let record = self.get_contact(contact).await?;
        let subscribed = record
            .subscriptions
            .iter()
            .any(|s| s.active && s.channel.map(|c| c.id) == Some(channel_id));
        if subscribed {
            return Ok(false);
        }

        self.create(
            "subscriptions",
            json!({
                "channel": channel_id,
                "active": true,
                "contact": contact,
                "subscribed_at": Utc::now(),
            }),
        )
        .await?;
        info!(contact_id = contact, channel = channel_name, "Contact subscribed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_step() -> Value {
        json!({
            "id": 3,
            "type": "channel",
            "contacts": [],
            "channel": {"id": 1},
            "composition": {"id": 2},
            "identity": {"id": 5},
            "connections_from_this_step": [
                {"id": 9, "journey_step_rules": [{"id": 4, "journey_step_rule_scores": []}]}
            ]
        })
    }

    #[test]
    fn test_created_score_item_without_id_is_an_error() {
        let id = created_id(&json!({"id": 41, "name": "opened"}), "score item").unwrap();
        assert_eq!(id, json!(41));
        for created in [json!({"name": "opened"}), json!({"id": null})] {
            let err = created_id(&created, "score item").unwrap_err();
            assert!(matches!(err, JourneyError::Content(_)));
            assert!(err.to_string().contains("score item created without id"), "{err}");
        }
    }

    #[test]
    fn test_fully_populated_step_is_valid() {
        assert!(validate_populated_step(&populated_step()).is_ok());
    }

    #[test]
    fn test_null_relation_counts_as_populated() {
        let mut raw = populated_step();
        raw["channel"] = Value::Null;
        assert!(validate_populated_step(&raw).is_ok());
    }

    #[test]
    fn test_missing_relation_is_config_error() {
        for relation in STEP_RELATIONS {
            let mut raw = populated_step();
            raw.as_object_mut().unwrap().remove(relation);
            let err = validate_populated_step(&raw).unwrap_err();
            assert!(err.is_config());
            assert!(err.to_string().contains(relation), "{err}");
        }
    }

    #[test]
    fn test_missing_nested_relations() {
        let mut raw = populated_step();
        raw["connections_from_this_step"][0]
            .as_object_mut()
            .unwrap()
            .remove("journey_step_rules");
        let err = validate_populated_step(&raw).unwrap_err();
        assert!(err.to_string().contains("journey_step_rules"));

        let mut raw = populated_step();
        raw["connections_from_this_step"][0]["journey_step_rules"][0]
            .as_object_mut()
            .unwrap()
            .remove("journey_step_rule_scores");
        let err = validate_populated_step(&raw).unwrap_err();
        assert!(err.to_string().contains("journey_step_rule_scores"));
    }

    #[test]
    fn test_payload_target_step_shapes() {
        let as_string = json!("{\"target_step\": 12}");
        assert_eq!(payload_target_step(&as_string).unwrap(), Some(12));
        assert_eq!(payload_target_step(&json!({"target_step": "7"})).unwrap(), Some(7));
        assert_eq!(payload_target_step(&json!({"target_step": null})).unwrap(), None);
        assert_eq!(payload_target_step(&Value::Null).unwrap(), None);
        assert!(payload_target_step(&json!("not json")).is_err());
    }

    #[test]
    fn test_step_query_sorts_connections_by_priority() {
        let params = populated_step_params(5);
        assert!(params.contains(&param("filters[id][$eq]", 5)));
        assert!(params.contains(&param(
            "populate[connections_from_this_step][sort][0]",
            "priority:asc"
        )));
    }

    #[test]
    fn test_document_id_prefers_document_id() {
        assert_eq!(document_id(&json!({"id": 1, "documentId": "abc"})).as_deref(), Some("abc"));
        assert_eq!(document_id(&json!({"id": 1})).as_deref(), Some("1"));
    }
}
