use journey_core::records::{JourneyStep, RuleScore};
use journey_core::types::{
    ConnectionId, ContactId, JobMessage, JourneyId, StepId, StepKind, Timing,
};
use journey_core::JourneyResult;

/// A contact positioned on a step of a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRef {
    pub contact: ContactId,
    pub journey: JourneyId,
    pub step: StepId,
}

impl From<&JobMessage> for StepRef {
    fn from(job: &JobMessage) -> Self {
        Self {
            contact: job.contact_id,
            journey: job.journey_id,
            step: job.step_id,
        }
    }
}

/// Input to [`crate::Dispatcher::create_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub contact: ContactId,
    pub journey: JourneyId,
    pub step: StepId,
    pub kind: StepKind,
    pub timing: Option<Timing>,
    pub ignore_subscription: bool,
}

impl NewJob {
    /// Job for `contact` on `step`. Fails when a channel step is missing its
    /// composition or channel.
    pub fn for_step(contact: ContactId, journey: JourneyId, step: &JourneyStep) -> JourneyResult<Self> {
        Ok(Self {
            contact,
            journey,
            step: step.id,
            kind: step.kind()?,
            timing: step.timing.clone(),
            ignore_subscription: false,
        })
    }

    pub fn ignoring_subscription(mut self) -> Self {
        self.ignore_subscription = true;
        self
    }
}

/// The connection chosen by the rule engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchDecision {
    pub connection: ConnectionId,
    pub target: Option<StepId>,
    pub score: f64,
    pub score_items: Vec<RuleScore>,
}

/// Result of evaluating one connection's rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub passed_count: usize,
    pub score: f64,
    pub score_items: Vec<RuleScore>,
}

/// What a consumer did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Step executed and a rule-check job was enqueued.
    RuleCheckQueued,
    /// Contact moved to `to`, whose job was enqueued.
    Advanced { to: StepId },
    /// Contact left the journey.
    Finished,
    /// No connection passed; re-check scheduled.
    Deferred { attempt: u32 },
    /// Journey scanned.
    Scanned { contacts: usize, advanced: usize },
    /// Webhook launched jobs from matching trigger steps.
    Triggered { steps: usize, jobs: usize },
    /// Nothing to do.
    Skipped { reason: &'static str },
}
