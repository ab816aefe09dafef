//! Queue consumers. Each one decodes its payload, hands it to the engine and
//! reports an explicit outcome: `Ok` acks, `Err` dead-letters.

pub mod delayed;
pub mod job;
pub mod journey_scan;
pub mod rule_check;
pub mod trigger;

use std::sync::Arc;

use async_trait::async_trait;
use journey_broker::{BrokerClient, Delivery, MessageHandler, Outcome, Queue};
use journey_core::JourneyResult;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use crate::engine::JourneyEngine;
use crate::types::Handled;

pub use delayed::DelayedConsumer;
pub use job::JobConsumer;
pub use journey_scan::JourneyScanConsumer;
pub use rule_check::RuleCheckConsumer;
pub use trigger::TriggerConsumer;

#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    type Message: DeserializeOwned + Send;

    fn queue(&self) -> Queue;

    /// Identifier logged with every failure.
    fn job_id(message: &Self::Message) -> String;

    async fn process(&self, message: Self::Message) -> JourneyResult<Handled>;
}

/// Adapts a [`Consumer`] to the broker's [`MessageHandler`].
pub struct ConsumerAdapter<C> {
    consumer: C,
}

impl<C: Consumer> ConsumerAdapter<C> {
    pub fn new(consumer: C) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl<C: Consumer> MessageHandler for ConsumerAdapter<C> {
    async fn handle(&self, delivery: Delivery) -> Outcome {
        let queue = self.consumer.queue().name();
        let message: C::Message = match serde_json::from_slice(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    queue,
                    message_id = delivery.message_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "Undecodable message, dead-lettering"
                );
                metrics::counter!("journey.consumer.nack", "queue" => queue).increment(1);
                return Outcome::reject(format!("decode: {e}"));
            }
        };

        let job_id = C::job_id(&message);
        match self.consumer.process(message).await {
            Ok(handled) => {
                debug!(queue, job_id = %job_id, ?handled, "Message handled");
                metrics::counter!("journey.consumer.ack", "queue" => queue).increment(1);
                Outcome::Ack
            }
            Err(e) => {
                error!(
                    queue,
                    job_id = %job_id,
                    config_error = e.is_config(),
                    error = %e,
                    "Job failed, dead-lettering"
                );
                metrics::counter!("journey.consumer.nack", "queue" => queue).increment(1);
                Outcome::reject(e.to_string())
            }
        }
    }
}

async fn attach<C: Consumer>(broker: &Arc<dyn BrokerClient>, consumer: C) -> JourneyResult<()> {
    let queue = consumer.queue();
    broker
        .consume(queue, Arc::new(ConsumerAdapter::new(consumer)))
        .await?;
    info!(queue = %queue, "Consumer attached");
    Ok(())
}

/// Attaches all five consumers. Topology must already be declared.
pub async fn attach_all(
    broker: &Arc<dyn BrokerClient>,
    engine: Arc<JourneyEngine>,
) -> JourneyResult<()> {
    attach(broker, JourneyScanConsumer::new(engine.clone())).await?;
    attach(broker, JobConsumer::new(engine.clone())).await?;
    attach(broker, DelayedConsumer::new(engine.clone())).await?;
    attach(broker, RuleCheckConsumer::new(engine.clone())).await?;
    attach(broker, TriggerConsumer::new(engine)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_core::JourneyError;

    struct Echo;

    #[async_trait]
    impl Consumer for Echo {
        type Message = serde_json::Value;

        fn queue(&self) -> Queue {
            Queue::Job
        }

        fn job_id(message: &Self::Message) -> String {
            message["jobId"].as_str().unwrap_or("-").to_string()
        }

        async fn process(&self, message: Self::Message) -> JourneyResult<Handled> {
            if message["fail"].as_bool() == Some(true) {
                return Err(JourneyError::config("step 3 has no channel"));
            }
            Ok(Handled::Finished)
        }
    }

    fn delivery(payload: &[u8]) -> Delivery {
        Delivery {
            queue: Queue::Job,
            payload: payload.to_vec(),
            message_id: Some("job-contact:1-journey:2-step:3".into()),
        }
    }

    #[tokio::test]
    async fn test_success_acks() {
        let adapter = ConsumerAdapter::new(Echo);
        let outcome = adapter.handle(delivery(br#"{"jobId":"a"}"#)).await;
        assert_eq!(outcome, Outcome::Ack);
    }

    #[tokio::test]
    async fn test_error_rejects_with_reason() {
        let adapter = ConsumerAdapter::new(Echo);
        let outcome = adapter.handle(delivery(br#"{"jobId":"a","fail":true}"#)).await;
        match outcome {
            Outcome::Reject { reason } => assert!(reason.contains("no channel")),
            Outcome::Ack => panic!("expected a reject"),
        }
    }

    #[test]
    fn test_job_consumers_report_the_originating_job_id() {
        let job: journey_core::types::JobMessage = serde_json::from_value(serde_json::json!({
            "jobId": "job-contact:1-journey:2-step:3",
            "contactId": 1,
            "journeyId": 2,
            "stepId": 3,
            "type": "channel",
            "compositionId": 11,
            "channel": 12,
            "ruleCheck": true,
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_ne!(job.idempotency_key(), job.job_id);
        for id in [
            JobConsumer::job_id(&job),
            DelayedConsumer::job_id(&job),
            RuleCheckConsumer::job_id(&job),
        ] {
            assert_eq!(id, "job-contact:1-journey:2-step:3");
        }
    }

    #[tokio::test]
    async fn test_garbage_payload_rejects() {
        let adapter = ConsumerAdapter::new(Echo);
        let outcome = adapter.handle(delivery(b"not json")).await;
        assert!(!outcome.is_ack());
    }
}
