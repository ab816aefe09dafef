//! In-memory collaborators for tests and local runs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;
use journey_core::records::{
    Contact, Journey, JourneyStep, JourneyStepRule, PassedStep, Reference, SendRequest,
    StepAction, StepReached, Subscription,
};
use journey_core::types::{ChannelId, CompositionId, ContactId, JourneyId, RuleId, StepId, StepType};
use journey_core::{JourneyError, JourneyResult};
use parking_lot::Mutex;

use crate::store::{ContentStore, RuleEvaluator, StepSender};

/// A recorded step-membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepMove {
    pub contact: ContactId,
    pub from: StepId,
    pub journey: JourneyId,
    pub to: Option<StepId>,
}

#[derive(Default)]
pub struct MemoryContentStore {
    journeys: DashMap<JourneyId, Journey>,
    steps: DashMap<StepId, JourneyStep>,
    contacts: DashMap<ContactId, Contact>,
    channels: DashMap<String, ChannelId>,
    actions: Mutex<Vec<StepAction>>,
    finished: Mutex<Vec<(ContactId, JourneyId)>>,
    passed: Mutex<Vec<PassedStep>>,
    moves: Mutex<Vec<StepMove>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a journey. Its steps are tracked through [`Self::insert_step`].
    pub fn insert_journey(&self, mut journey: Journey) {
        journey.journey_steps.clear();
        self.journeys.insert(journey.id, journey);
    }

    /// Stores a step; contacts listed on it are attached to the step and
    /// its journey.
    pub fn insert_step(&self, mut step: JourneyStep) {
        step.connections_from_this_step.sort_by_key(|c| c.priority);
        let journey = step.journey.map(|j| j.id);
        for contact in &step.contacts {
            let mut entry = self.contacts.entry(contact.id).or_insert_with(|| Contact {
                id: contact.id,
                journeys: Vec::new(),
                journey_steps: Vec::new(),
                subscriptions: Vec::new(),
            });
            push_unique(&mut entry.journey_steps, step.id);
            if let Some(journey) = journey {
                push_unique(&mut entry.journeys, journey);
            }
        }
        self.steps.insert(step.id, step);
    }

    pub fn insert_contact(&self, contact: Contact) {
        self.contacts.insert(contact.id, contact);
    }

    pub fn insert_channel(&self, name: &str, id: ChannelId) {
        self.channels.insert(name.to_lowercase(), id);
    }

    pub fn set_journey_active(&self, id: JourneyId, active: bool) {
        if let Some(mut journey) = self.journeys.get_mut(&id) {
            journey.active = active;
        }
    }

    pub fn actions(&self) -> Vec<StepAction> {
        self.actions.lock().clone()
    }

    pub fn finished(&self) -> Vec<(ContactId, JourneyId)> {
        self.finished.lock().clone()
    }

    pub fn passed_steps(&self) -> Vec<PassedStep> {
        self.passed.lock().clone()
    }

    pub fn moves(&self) -> Vec<StepMove> {
        self.moves.lock().clone()
    }

    /// Step ids the contact is currently attached to.
    pub fn contact_steps(&self, contact: ContactId) -> Vec<StepId> {
        self.contacts
            .get(&contact)
            .map(|c| c.journey_steps.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    pub fn contact_journeys(&self, contact: ContactId) -> Vec<JourneyId> {
        self.contacts
            .get(&contact)
            .map(|c| c.journeys.iter().map(|j| j.id).collect())
            .unwrap_or_default()
    }

    fn journey_steps(&self, journey: JourneyId) -> Vec<JourneyStep> {
        let mut steps: Vec<JourneyStep> = self
            .steps
            .iter()
            .filter(|s| s.journey.map(|j| j.id) == Some(journey))
            .map(|s| s.clone())
            .collect();
        steps.sort_by_key(|s| s.id);
        steps
    }
}

fn push_unique(refs: &mut Vec<Reference>, id: u64) {
    if !refs.iter().any(|r| r.id == id) {
        refs.push(Reference::from(id));
    }
}

fn remove_ref(refs: &mut Vec<Reference>, id: u64) {
    refs.retain(|r| r.id != id);
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_journey(&self, id: JourneyId) -> JourneyResult<Journey> {
        let mut journey = self
            .journeys
            .get(&id)
            .map(|j| j.clone())
            .ok_or(JourneyError::NotFound {
                entity: "journey",
                id,
            })?;
        journey.journey_steps = self.journey_steps(id);
        Ok(journey)
    }

    async fn list_active_journeys(&self) -> JourneyResult<Vec<Journey>> {
        let mut journeys: Vec<Journey> = self
            .journeys
            .iter()
            .filter(|j| j.active)
            .map(|j| j.clone())
            .collect();
        journeys.sort_by_key(|j| j.id);
        Ok(journeys)
    }

    async fn get_journey_step(&self, id: StepId) -> JourneyResult<JourneyStep> {
        self.steps
            .get(&id)
            .map(|s| s.clone())
            .ok_or(JourneyError::NotFound {
                entity: "journey step",
                id,
            })
    }

    async fn find_trigger_steps(&self) -> JourneyResult<Vec<JourneyStep>> {
        let mut steps: Vec<JourneyStep> = self
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Trigger)
            .filter(|s| {
                s.journey
                    .and_then(|j| self.journeys.get(&j.id).map(|j| j.active))
                    .unwrap_or(false)
            })
            .map(|s| s.clone())
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    async fn get_contact(&self, id: ContactId) -> JourneyResult<Contact> {
        self.contacts
            .get(&id)
            .map(|c| c.clone())
            .ok_or(JourneyError::NotFound {
                entity: "contact",
                id,
            })
    }

    async fn pass_contact_to_next_step(
        &self,
        contact: ContactId,
        current: StepId,
        journey: JourneyId,
        next: Option<StepId>,
    ) -> JourneyResult<()> {
        {
            let mut record = self
                .contacts
                .get_mut(&contact)
                .ok_or(JourneyError::NotFound {
                    entity: "contact",
                    id: contact,
                })?;
            remove_ref(&mut record.journey_steps, current);
            match next {
                Some(next) => push_unique(&mut record.journey_steps, next),
                None => remove_ref(&mut record.journeys, journey),
            }
        }

        if let Some(mut step) = self.steps.get_mut(&current) {
            remove_ref(&mut step.contacts, contact);
        }
        if let Some(next) = next {
            if let Some(mut step) = self.steps.get_mut(&next) {
                push_unique(&mut step.contacts, contact);
            }
        }

        self.moves.lock().push(StepMove {
            contact,
            from: current,
            journey,
            to: next,
        });
        Ok(())
    }

    async fn create_action(&self, action: &StepAction) -> JourneyResult<()> {
        self.actions.lock().push(action.clone());
        Ok(())
    }

    async fn create_finish_action(
        &self,
        contact: ContactId,
        journey: JourneyId,
    ) -> JourneyResult<()> {
        self.finished.lock().push((contact, journey));
        Ok(())
    }

    async fn add_passed_step(&self, passed: &PassedStep) -> JourneyResult<()> {
        self.passed.lock().push(passed.clone());
        Ok(())
    }

    async fn has_passed_step(
        &self,
        step: StepId,
        contact: ContactId,
        composition: CompositionId,
    ) -> JourneyResult<bool> {
        Ok(self.passed.lock().iter().any(|p| {
            p.step == step && p.contact == contact && p.composition == Some(composition)
        }))
    }

    async fn find_step_reached(
        &self,
        step: StepId,
        contact: ContactId,
    ) -> JourneyResult<Option<StepReached>> {
        Ok(self
            .actions
            .lock()
            .iter()
            .rev()
            .find(|a| a.step == step && a.contact == contact)
            .map(|a| StepReached {
                target_step: a.target_step,
            }))
    }

    async fn ensure_subscription(
        &self,
        contact: ContactId,
        channel_name: &str,
    ) -> JourneyResult<bool> {
        let Some(channel) = self.channels.get(&channel_name.to_lowercase()).map(|c| *c) else {
            return Ok(false);
        };
        let mut record = self
            .contacts
            .get_mut(&contact)
            .ok_or(JourneyError::NotFound {
                entity: "contact",
                id: contact,
            })?;
        let subscribed = record
            .subscriptions
            .iter()
            .any(|s| s.active && s.channel.map(|c| c.id) == Some(channel));
        if subscribed {
            return Ok(false);
        }
        record.subscriptions.push(Subscription {
            channel: Some(Reference::from(channel)),
            active: true,
        });
        Ok(true)
    }
}

/// Scriptable rule evaluator. Each rule returns its queued results in order,
/// then its fixed result, then `false`.
#[derive(Default)]
pub struct MemoryRuleEvaluator {
    queued: Mutex<HashMap<RuleId, VecDeque<bool>>>,
    fixed: DashMap<RuleId, bool>,
    failing: DashMap<RuleId, String>,
    calls: Mutex<Vec<(RuleId, ContactId)>>,
}

impl MemoryRuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, rule: RuleId, passes: bool) {
        self.fixed.insert(rule, passes);
    }

    /// Results returned by the next evaluations of `rule`.
    pub fn queue(&self, rule: RuleId, results: impl IntoIterator<Item = bool>) {
        self.queued
            .lock()
            .entry(rule)
            .or_default()
            .extend(results);
    }

    pub fn fail(&self, rule: RuleId, message: &str) {
        self.failing.insert(rule, message.to_string());
    }

    pub fn calls(&self) -> Vec<(RuleId, ContactId)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RuleEvaluator for MemoryRuleEvaluator {
    async fn evaluate(&self, rule: &JourneyStepRule, contact: ContactId) -> JourneyResult<bool> {
        self.calls.lock().push((rule.id, contact));
        if let Some(message) = self.failing.get(&rule.id) {
            return Err(JourneyError::RuleEvaluation(message.clone()));
        }
        if let Some(result) = self
            .queued
            .lock()
            .get_mut(&rule.id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(result);
        }
        Ok(self.fixed.get(&rule.id).map(|r| *r).unwrap_or(false))
    }
}

#[derive(Default)]
pub struct MemorySender {
    sent: Mutex<Vec<SendRequest>>,
    fail: Mutex<bool>,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl StepSender for MemorySender {
    async fn send(&self, request: &SendRequest) -> JourneyResult<()> {
        if *self.fail.lock() {
            return Err(JourneyError::Send("sender unavailable".to_string()));
        }
        self.sent.lock().push(request.clone());
        Ok(())
    }
}
