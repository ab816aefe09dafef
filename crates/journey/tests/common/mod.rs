//! Shared wiring for flow tests: every collaborator in memory, all five
//! consumers attached to the in-memory broker.

#![allow(dead_code)]

use std::sync::Arc;

use journey_broker::{BrokerClient, MemoryBroker, Queue};
use journey_cache::LocalMarkerStore;
use journey_content::{MemoryContentStore, MemoryRuleEvaluator, MemorySender};
use journey_core::config::SchedulerConfig;
use journey_core::event_bus::{capture_sink, CaptureSink};
use journey_core::records::{
    ConditionType, Journey, JourneyStep, JourneyStepConnection, JourneyStepRule, Reference,
    RuleScore,
};
use journey_core::types::{ContactId, JobMessage, JourneyId, StepId, StepType};
use journey_engine::{attach_all, EngineSettings, JourneyEngine, NewJob, Scheduler};
use serde_json::Value;

pub const CONTACT: ContactId = 7;
pub const JOURNEY: JourneyId = 1;

pub struct Harness {
    pub store: Arc<MemoryContentStore>,
    pub sender: Arc<MemorySender>,
    pub evaluator: Arc<MemoryRuleEvaluator>,
    pub broker: Arc<MemoryBroker>,
    pub markers: Arc<LocalMarkerStore>,
    pub sink: Arc<CaptureSink>,
    pub engine: Arc<JourneyEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(EngineSettings::default()).await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryContentStore::new());
        let sender = Arc::new(MemorySender::new());
        let evaluator = Arc::new(MemoryRuleEvaluator::new());
        let broker = Arc::new(MemoryBroker::new());
        let sink = capture_sink();
        broker.setup().await.unwrap();

        let engine = Arc::new(JourneyEngine::new(
            store.clone(),
            sender.clone(),
            evaluator.clone(),
            broker.clone(),
            sink.clone(),
            settings,
        ));
        let client: Arc<dyn BrokerClient> = broker.clone();
        attach_all(&client, engine.clone()).await.unwrap();

        store.insert_journey(journey(JOURNEY, true));
        Self {
            store,
            sender,
            evaluator,
            broker,
            markers: Arc::new(LocalMarkerStore::default()),
            sink,
            engine,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.engine.clone(),
            self.markers.clone(),
            SchedulerConfig::default(),
        )
    }

    /// Enqueues the first job for `contact` on `step`.
    pub async fn start(&self, contact: ContactId, step: &JourneyStep) -> JobMessage {
        let job = NewJob::for_step(contact, JOURNEY, step).unwrap();
        self.engine.dispatcher().create_job(job).await.unwrap()
    }

    /// Delivers the next message on `queue` and asserts it was acked.
    pub async fn deliver(&self, queue: Queue) {
        let outcome = self
            .broker
            .dispatch(queue)
            .await
            .unwrap_or_else(|| panic!("no message on {queue}"));
        assert!(outcome.is_ack(), "{queue} rejected: {outcome:?}");
    }

    pub fn last_job(&self, queue: Queue) -> JobMessage {
        let published = self.broker.published_to(queue);
        let last = published.last().unwrap_or_else(|| panic!("nothing published to {queue}"));
        serde_json::from_slice(&last.payload).unwrap()
    }
}

pub fn journey(id: JourneyId, active: bool) -> Journey {
    Journey {
        id,
        name: format!("journey {id}"),
        active,
        journey_steps: Vec::new(),
    }
}

pub fn step(id: StepId, step_type: StepType, contacts: &[ContactId]) -> JourneyStep {
    let channel = step_type == StepType::Channel;
    JourneyStep {
        id,
        step_type,
        journey: Some(Reference::from(JOURNEY)),
        channel: channel.then(|| Reference::from(3)),
        composition: channel.then(|| Reference::from(40 + id)),
        timing: None,
        additional_data: Value::Null,
        contacts: contacts.iter().map(|c| Reference::from(*c)).collect(),
        connections_from_this_step: Vec::new(),
        connections_to_this_step: Vec::new(),
    }
}

/// Adds a connection guarded by `rules`, each worth 1.5 points.
pub fn connect(
    from: &mut JourneyStep,
    id: u64,
    priority: i64,
    target: StepId,
    condition: ConditionType,
    rules: &[u64],
) {
    from.connections_from_this_step.push(JourneyStepConnection {
        id,
        priority,
        condition_type: condition,
        target_step: Some(Reference::from(target)),
        journey_step_rules: rules
            .iter()
            .map(|r| JourneyStepRule {
                id: *r,
                journey_step_rule_scores: vec![RuleScore {
                    name: format!("rule {r}"),
                    value: 1.5,
                }],
                ..Default::default()
            })
            .collect(),
    });
}
