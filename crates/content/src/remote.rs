//! HTTP clients for the rule evaluator and the channel sender. Both are
//! opaque remote calls; a transport failure or non-success status surfaces
//! as an error on the current message.

use std::time::Duration;

use async_trait::async_trait;
use journey_core::config::ContentConfig;
use journey_core::records::{JourneyStepRule, SendRequest};
use journey_core::types::ContactId;
use journey_core::{JourneyError, JourneyResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::{RuleEvaluator, StepSender};

fn client(timeout_ms: u64) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleCheckRequest<'a> {
    rule: &'a JourneyStepRule,
    contact_id: ContactId,
}

#[derive(Deserialize)]
struct RuleCheckResponse {
    #[serde(alias = "passed", alias = "result")]
    data: bool,
}

pub struct HttpRuleEvaluator {
    http: Client,
    url: String,
    token: String,
}

impl HttpRuleEvaluator {
    pub fn new(config: &ContentConfig) -> JourneyResult<Self> {
        let http = client(config.request_timeout_ms)
            .map_err(|e| JourneyError::RuleEvaluation(e.to_string()))?;
        Ok(Self {
            http,
            url: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                config.rule_evaluator_path
            ),
            token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl RuleEvaluator for HttpRuleEvaluator {
    async fn evaluate(&self, rule: &JourneyStepRule, contact: ContactId) -> JourneyResult<bool> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&RuleCheckRequest {
                rule,
                contact_id: contact,
            })
            .send()
            .await
            .map_err(|e| JourneyError::RuleEvaluation(format!("rule {}: {e}", rule.id)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JourneyError::RuleEvaluation(format!(
                "rule {} returned {status}",
                rule.id
            )));
        }

        let body: RuleCheckResponse = response
            .json()
            .await
            .map_err(|e| JourneyError::RuleEvaluation(format!("rule {}: {e}", rule.id)))?;
        debug!(rule_id = rule.id, contact_id = contact, passed = body.data, "Rule evaluated");
        Ok(body.data)
    }
}

pub struct HttpSender {
    http: Client,
    url: String,
    token: String,
}

impl HttpSender {
    pub fn new(config: &ContentConfig) -> JourneyResult<Self> {
        let http =
            client(config.request_timeout_ms).map_err(|e| JourneyError::Send(e.to_string()))?;
        Ok(Self {
            http,
            url: config.sender_url.clone(),
            token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl StepSender for HttpSender {
    async fn send(&self, request: &SendRequest) -> JourneyResult<()> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|e| JourneyError::Send(format!("step {}: {e}", request.step_id)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(JourneyError::Send(format!(
                "step {} returned {status}: {text}",
                request.step_id
            )));
        }
        metrics::counter!("journey.sender.sent").increment(1);
        Ok(())
    }
}
