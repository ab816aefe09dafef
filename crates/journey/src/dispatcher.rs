//! Job dispatch: decides between immediate and delayed delivery and
//! publishes the job with its idempotency key.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use journey_broker::{BrokerClient, OutboundMessage, Queue};
use journey_core::event_bus::{make_event, EventSink, JourneyEventKind};
use journey_core::types::{job_key, JobMessage, ScanJob, Timing};
use journey_core::webhook::WebhookEvent;
use journey_core::JourneyResult;
use serde::Serialize;
use tracing::info;

use crate::types::NewJob;

/// Where and when a job is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub queue: Queue,
    pub delay: Duration,
}

/// Timed steps go to the delayed queue; everything else runs immediately.
pub fn plan(timing: Option<&Timing>, now: DateTime<Utc>) -> Dispatch {
    match timing {
        Some(timing) => Dispatch {
            queue: Queue::Delayed,
            delay: timing.delay_from(now),
        },
        None => Dispatch {
            queue: Queue::Job,
            delay: Duration::ZERO,
        },
    }
}

pub struct Dispatcher {
    broker: Arc<dyn BrokerClient>,
    sink: Arc<dyn EventSink>,
    rule_check_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        sink: Arc<dyn EventSink>,
        rule_check_backoff: Duration,
    ) -> Self {
        Self {
            broker,
            sink,
            rule_check_backoff,
        }
    }

    async fn publish<T: Serialize>(
        &self,
        queue: Queue,
        payload: &T,
        delay: Duration,
        message_id: Option<String>,
    ) -> JourneyResult<()> {
        let mut message = OutboundMessage::new(queue, serde_json::to_vec(payload)?).with_delay(delay);
        if let Some(id) = message_id {
            message = message.with_message_id(id);
        }
        self.broker.publish(message).await?;
        metrics::counter!("journey.jobs.created", "queue" => queue.name()).increment(1);
        Ok(())
    }

    /// Publishes the job for one contact/journey/step triple.
    pub async fn create_job(&self, job: NewJob) -> JourneyResult<JobMessage> {
        let now = Utc::now();
        let message = JobMessage {
            job_id: job_key(job.contact, job.journey, job.step),
            contact_id: job.contact,
            journey_id: job.journey,
            step_id: job.step,
            kind: job.kind,
            timing: job.timing,
            rule_check: false,
            ignore_subscription: job.ignore_subscription,
            attempt: 0,
            created_at: now,
        };

        let dispatch = plan(message.timing.as_ref(), now);
        self.publish(
            dispatch.queue,
            &message,
            dispatch.delay,
            Some(message.idempotency_key()),
        )
        .await?;

        self.sink.emit(make_event(
            JourneyEventKind::JobCreated,
            message.journey_id,
            Some(message.contact_id),
            Some(message.step_id),
            Some(message.job_id.clone()),
        ));
        info!(
            job_id = %message.job_id,
            queue = %dispatch.queue,
            delay_ms = dispatch.delay.as_millis() as u64,
            step_type = %message.step_type(),
            "New job created"
        );
        Ok(message)
    }

    /// Publishes the rule-check variant of `job`, undelayed.
    pub async fn create_rule_check_job(&self, job: &JobMessage) -> JourneyResult<JobMessage> {
        let message = JobMessage {
            rule_check: true,
            attempt: 0,
            ..job.clone()
        };
        let key = message.idempotency_key();
        self.publish(Queue::RuleCheck, &message, Duration::ZERO, Some(key.clone()))
            .await?;

        self.sink.emit(make_event(
            JourneyEventKind::RuleCheckScheduled,
            message.journey_id,
            Some(message.contact_id),
            Some(message.step_id),
            Some(message.job_id.clone()),
        ));
        info!(job_id = %key, "Rule check job created");
        Ok(message)
    }

    /// Re-publishes a rule check to the delayed queue after the back-off.
    pub async fn defer_rule_check(&self, job: &JobMessage) -> JourneyResult<JobMessage> {
        let message = JobMessage {
            rule_check: true,
            attempt: job.attempt.saturating_add(1),
            ..job.clone()
        };
        let key = message.idempotency_key();
        self.publish(
            Queue::Delayed,
            &message,
            self.rule_check_backoff,
            Some(key.clone()),
        )
        .await?;

        metrics::counter!("journey.rule_check.deferred").increment(1);
        self.sink.emit(make_event(
            JourneyEventKind::RuleCheckDeferred,
            message.journey_id,
            Some(message.contact_id),
            Some(message.step_id),
            Some(message.job_id.clone()),
        ));
        info!(
            job_id = %key,
            attempt = message.attempt,
            backoff_secs = self.rule_check_backoff.as_secs(),
            "No connection passed, rule check deferred"
        );
        Ok(message)
    }

    pub async fn create_scan_job(&self, scan: &ScanJob) -> JourneyResult<()> {
        self.publish(Queue::Journey, scan, Duration::ZERO, Some(scan.job_key.clone()))
            .await?;
        self.sink.emit(make_event(
            JourneyEventKind::ScanScheduled,
            scan.journey_id,
            None,
            None,
            Some(scan.job_key.clone()),
        ));
        Ok(())
    }

    /// Enqueues an inbound webhook for the trigger consumer.
    pub async fn publish_trigger_event(&self, event: &WebhookEvent) -> JourneyResult<()> {
        self.publish(Queue::Trigger, event, Duration::ZERO, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_broker::MemoryBroker;
    use journey_core::event_bus::capture_sink;
    use journey_core::types::StepKind;

    fn new_job(timing: Option<Timing>) -> NewJob {
        NewJob {
            contact: 1,
            journey: 2,
            step: 3,
            kind: StepKind::Channel {
                composition: 4,
                channel: 5,
            },
            timing,
            ignore_subscription: false,
        }
    }

    async fn dispatcher() -> (Arc<MemoryBroker>, Dispatcher) {
        let broker = Arc::new(MemoryBroker::new());
        broker.setup().await.unwrap();
        let dispatcher = Dispatcher::new(broker.clone(), capture_sink(), Duration::from_secs(600));
        (broker, dispatcher)
    }

    #[test]
    fn test_plan_without_timing_is_immediate() {
        let dispatch = plan(None, Utc::now());
        assert_eq!(dispatch.queue, Queue::Job);
        assert_eq!(dispatch.delay, Duration::ZERO);
    }

    #[test]
    fn test_plan_delay_minutes() {
        let dispatch = plan(Some(&Timing::Delay(10.0)), Utc::now());
        assert_eq!(dispatch.queue, Queue::Delayed);
        assert_eq!(dispatch.delay.as_millis(), 600_000);
    }

    #[test]
    fn test_plan_publish_time_clamps_past() {
        let now = Utc::now();
        let ahead = plan(Some(&Timing::Publish(now + chrono::Duration::minutes(5))), now);
        assert_eq!(ahead.queue, Queue::Delayed);
        assert_eq!(ahead.delay.as_millis(), 300_000);

        let past = plan(Some(&Timing::Publish(now - chrono::Duration::minutes(5))), now);
        assert_eq!(past.queue, Queue::Delayed);
        assert_eq!(past.delay, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_create_job_publishes_with_idempotency_key() {
        let (broker, dispatcher) = dispatcher().await;
        let job = dispatcher.create_job(new_job(None)).await.unwrap();
        assert_eq!(job.job_id, "job-contact:1-journey:2-step:3");

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue, Queue::Job);
        assert_eq!(published[0].message_id.as_deref(), Some("job-contact:1-journey:2-step:3"));

        let wire: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(wire["type"], "channel");
        assert_eq!(wire["compositionId"], 4);
        assert_eq!(wire["ruleCheck"], false);
    }

    #[tokio::test]
    async fn test_delayed_job_carries_delay() {
        let (broker, dispatcher) = dispatcher().await;
        dispatcher.create_job(new_job(Some(Timing::Delay(10.0)))).await.unwrap();
        let published = broker.published_to(Queue::Delayed);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].delay_ms(), 600_000);
    }

    #[tokio::test]
    async fn test_rule_check_and_deferral_keys() {
        let (broker, dispatcher) = dispatcher().await;
        let job = dispatcher.create_job(new_job(None)).await.unwrap();

        let check = dispatcher.create_rule_check_job(&job).await.unwrap();
        assert!(check.rule_check);
        let deferred = dispatcher.defer_rule_check(&check).await.unwrap();
        assert_eq!(deferred.attempt, 1);

        let rule_checks = broker.published_to(Queue::RuleCheck);
        assert_eq!(rule_checks[0].delay, Duration::ZERO);
        assert_eq!(
            rule_checks[0].message_id.as_deref(),
            Some("job-contact:1-journey:2-step:3-rule_check:true")
        );

        let delayed = broker.published_to(Queue::Delayed);
        assert_eq!(delayed[0].delay, Duration::from_secs(600));
        assert_eq!(delayed[0].message_id, rule_checks[0].message_id);
    }

    #[tokio::test]
    async fn test_trigger_event_has_no_message_id() {
        let (broker, dispatcher) = dispatcher().await;
        dispatcher
            .publish_trigger_event(&WebhookEvent::default())
            .await
            .unwrap();
        let published = broker.published_to(Queue::Trigger);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, None);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let (broker, dispatcher) = dispatcher().await;
        broker.set_fail_on_publish(true);
        let err = dispatcher.create_job(new_job(None)).await.unwrap_err();
        assert!(err.to_string().contains("Broker"));
    }
}
