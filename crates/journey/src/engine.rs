use std::sync::Arc;
use std::time::Duration;

use journey_broker::BrokerClient;
use journey_content::{ContentStore, RuleEvaluator, StepSender};
use journey_core::event_bus::{make_event, EventSink, JourneyEventKind};
use journey_core::records::{PassedStep, SendRequest, StepAction};
use journey_core::types::{JobMessage, StepId, StepKind};
use journey_core::{AppConfig, JourneyError, JourneyResult};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::evaluator::RuleEngine;
use crate::state_machine::{RuleCheckTransition, StepTransition};
use crate::types::{Handled, NewJob, StepRef};

/// Tunables shared by every consumer.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Channel a webhook-triggered contact gets subscribed to.
    pub default_channel: String,
    pub rule_check_backoff: Duration,
    /// Deferrals before a rule check gives up. `None` retries forever.
    pub max_rule_checks: Option<u32>,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_channel: config.trigger.default_channel.clone(),
            rule_check_backoff: config.rule_check.backoff(),
            max_rule_checks: config.rule_check.max_attempts,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Moves contacts through journeys: executes steps, branches through the
/// rule engine and enqueues follow-up jobs.
pub struct JourneyEngine {
    store: Arc<dyn ContentStore>,
    sender: Arc<dyn StepSender>,
    rules: RuleEngine,
    dispatcher: Dispatcher,
    event_sink: Arc<dyn EventSink>,
    settings: EngineSettings,
}

impl std::fmt::Debug for JourneyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl JourneyEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        sender: Arc<dyn StepSender>,
        evaluator: Arc<dyn RuleEvaluator>,
        broker: Arc<dyn BrokerClient>,
        event_sink: Arc<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        let dispatcher = Dispatcher::new(broker, event_sink.clone(), settings.rule_check_backoff);
        Self {
            store,
            sender,
            rules: RuleEngine::new(evaluator),
            dispatcher,
            event_sink,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn emit(&self, kind: JourneyEventKind, at: StepRef, job_id: Option<String>) {
        self.event_sink.emit(make_event(
            kind,
            at.journey,
            Some(at.contact),
            Some(at.step),
            job_id,
        ));
    }

    /// Moves the contact from `at` to `target` and enqueues the target's job.
    /// Without a target the contact leaves the journey.
    pub async fn create_next_job(&self, at: StepRef, target: Option<StepId>) -> JourneyResult<Handled> {
        self.store.get_journey(at.journey).await?;

        let Some(target) = target else {
            return self.finish_journey(at).await;
        };

        let next = self.store.get_journey_step(target).await?;
        let job = NewJob::for_step(at.contact, at.journey, &next)?;
        self.store
            .pass_contact_to_next_step(at.contact, at.step, at.journey, Some(target))
            .await?;
        let created = self.dispatcher.create_job(job).await?;

        self.emit(JourneyEventKind::StepAdvanced, at, Some(created.job_id));
        info!(
            contact_id = at.contact,
            journey_id = at.journey,
            from_step = at.step,
            to_step = target,
            "Contact advanced"
        );
        Ok(Handled::Advanced { to: target })
    }

    async fn finish_journey(&self, at: StepRef) -> JourneyResult<Handled> {
        self.store
            .pass_contact_to_next_step(at.contact, at.step, at.journey, None)
            .await?;
        self.store.create_finish_action(at.contact, at.journey).await?;

        self.emit(JourneyEventKind::JourneyFinished, at, None);
        info!(
            contact_id = at.contact,
            journey_id = at.journey,
            step_id = at.step,
            "Journey finished"
        );
        Ok(Handled::Finished)
    }

    /// Records the terminal zero-score action for `at`, then ends the journey.
    pub async fn finish_step(&self, at: StepRef) -> JourneyResult<Handled> {
        self.store
            .create_action(&StepAction::terminal(at.step, at.contact))
            .await?;
        self.create_next_job(at, None).await
    }

    /// Sends the channel step's composition unless the contact already passed
    /// this step with it, then records the passed step. Returns whether a
    /// send happened.
    pub async fn execute_step(&self, job: &JobMessage) -> JourneyResult<bool> {
        let StepKind::Channel {
            composition,
            channel,
        } = job.kind
        else {
            return Err(JourneyError::config(format!(
                "{} step {} cannot be executed",
                job.step_type(),
                job.step_id
            )));
        };

        let already_passed = self
            .store
            .has_passed_step(job.step_id, job.contact_id, composition)
            .await?;
        if already_passed {
            debug!(job_id = %job.job_id, "Step already passed, send skipped");
        } else {
            self.sender
                .send(&SendRequest {
                    contact_id: job.contact_id,
                    journey_id: job.journey_id,
                    step_id: job.step_id,
                    composition_id: composition,
                    channel_id: channel,
                    ignore_subscription: job.ignore_subscription,
                })
                .await?;
        }

        self.store
            .add_passed_step(&PassedStep {
                step: job.step_id,
                contact: job.contact_id,
                journey: job.journey_id,
                composition: Some(composition),
                channel: Some(channel),
            })
            .await?;

        self.emit(
            JourneyEventKind::StepExecuted,
            StepRef::from(job),
            Some(job.job_id.clone()),
        );
        Ok(!already_passed)
    }

    pub fn close_job(&self, job: &JobMessage) {
        info!(job_id = %job.job_id, "Job closed");
        self.emit(
            JourneyEventKind::JobClosed,
            StepRef::from(job),
            Some(job.job_id.clone()),
        );
    }

    /// Runs a step job from the `job` or `delayed` queue.
    pub async fn run_step(&self, job: &JobMessage) -> JourneyResult<Handled> {
        let step = self.store.get_journey_step(job.step_id).await?;
        let transition = StepTransition::for_step(&step);
        if step.step_type != job.step_type() {
            return Err(JourneyError::config(format!(
                "job {} carries a {} step but step {} is {}",
                job.job_id,
                job.step_type(),
                step.id,
                step.step_type
            )));
        }

        let at = StepRef::from(job);
        match transition {
            StepTransition::PassThrough { target } => {
                self.create_next_job(at, Some(target)).await
            }
            StepTransition::Finish => self.finish_step(at).await,
            StepTransition::ExecuteThenRuleCheck => {
                self.execute_step(job).await?;
                self.close_job(job);
                self.dispatcher.create_rule_check_job(job).await?;
                Ok(Handled::RuleCheckQueued)
            }
            StepTransition::ExecuteThenFinish => {
                self.execute_step(job).await?;
                self.close_job(job);
                self.finish_step(at).await
            }
        }
    }

    /// Evaluates the step's connections for the contact and advances, defers
    /// or gives up.
    pub async fn check_rules(&self, job: &JobMessage) -> JourneyResult<Handled> {
        let step = self.store.get_journey_step(job.step_id).await?;
        let decision = self
            .rules
            .process_step_connections(&step.connections_from_this_step, job.contact_id)
            .await?;

        let at = StepRef::from(job);
        match RuleCheckTransition::decide(
            step.has_connections(),
            decision,
            job.attempt,
            self.settings.max_rule_checks,
        ) {
            RuleCheckTransition::Advance(decision) => {
                self.store
                    .create_action(&StepAction {
                        step: job.step_id,
                        contact: job.contact_id,
                        score: decision.score,
                        score_items: decision.score_items,
                        target_step: decision.target,
                    })
                    .await?;
                self.close_job(job);
                self.create_next_job(at, decision.target).await
            }
            RuleCheckTransition::Defer => {
                let deferred = self.dispatcher.defer_rule_check(job).await?;
                Ok(Handled::Deferred {
                    attempt: deferred.attempt,
                })
            }
            RuleCheckTransition::Exhausted => {
                metrics::counter!("journey.rule_check.exhausted").increment(1);
                warn!(
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    "Rule check attempts exhausted, finishing journey"
                );
                self.finish_step(at).await
            }
            RuleCheckTransition::Finish => self.finish_step(at).await,
        }
    }
}
