use async_trait::async_trait;
use journey_core::records::{
    Contact, Journey, JourneyStep, JourneyStepRule, PassedStep, SendRequest, StepAction,
    StepReached,
};
use journey_core::types::{CompositionId, ContactId, JourneyId, StepId};
use journey_core::JourneyResult;

/// Read/write access to journeys, steps and contacts.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// A journey with its steps and the contacts attached to each step.
    async fn get_journey(&self, id: JourneyId) -> JourneyResult<Journey>;

    /// Journeys with `active = true`. Steps are not populated.
    async fn list_active_journeys(&self) -> JourneyResult<Vec<Journey>>;

    /// A fully populated step: outgoing connections sorted ascending by
    /// priority, each with its rules and each rule with its score items.
    /// A partially populated record is a configuration error.
    async fn get_journey_step(&self, id: StepId) -> JourneyResult<JourneyStep>;

    /// `trigger` steps belonging to active journeys, with their journey and
    /// outgoing connections.
    async fn find_trigger_steps(&self) -> JourneyResult<Vec<JourneyStep>>;

    async fn get_contact(&self, id: ContactId) -> JourneyResult<Contact>;

    /// Moves a contact off `current` and onto `next`. With `next = None`
    /// the contact leaves the journey. Re-applying the same move is a no-op.
    async fn pass_contact_to_next_step(
        &self,
        contact: ContactId,
        current: StepId,
        journey: JourneyId,
        next: Option<StepId>,
    ) -> JourneyResult<()>;

    /// Records the score items and a `step_reached` action.
    async fn create_action(&self, action: &StepAction) -> JourneyResult<()>;

    /// Records a `journey_finished` action.
    async fn create_finish_action(&self, contact: ContactId, journey: JourneyId)
        -> JourneyResult<()>;

    async fn add_passed_step(&self, passed: &PassedStep) -> JourneyResult<()>;

    async fn has_passed_step(
        &self,
        step: StepId,
        contact: ContactId,
        composition: CompositionId,
    ) -> JourneyResult<bool>;

    /// Latest `step_reached` action of a contact on a step, if any.
    async fn find_step_reached(
        &self,
        step: StepId,
        contact: ContactId,
    ) -> JourneyResult<Option<StepReached>>;

    /// Subscribes the contact to the named channel unless an active
    /// subscription exists. Returns true when one was created.
    async fn ensure_subscription(&self, contact: ContactId, channel_name: &str)
        -> JourneyResult<bool>;
}

/// Evaluates a single rule's predicate against a contact.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, rule: &JourneyStepRule, contact: ContactId) -> JourneyResult<bool>;
}

/// Renders and sends one composition over one channel.
#[async_trait]
pub trait StepSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> JourneyResult<()>;
}
