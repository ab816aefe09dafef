//! Pure transition tables for a contact's position on a step.
//!
//! Consumers fetch the step, ask this module what to do, and then perform
//! the side effects through [`crate::JourneyEngine`].

use journey_core::records::JourneyStep;
use journey_core::types::{StepId, StepType};

use crate::types::BranchDecision;

/// What a job on a step leads to once it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    /// Gate steps move straight to the first connection's target.
    PassThrough { target: StepId },
    /// Execute, then branch through a rule check.
    ExecuteThenRuleCheck,
    /// Execute, then record the terminal action and end the journey.
    ExecuteThenFinish,
    /// Record the terminal action and end the journey. Also taken by a gate
    /// whose first connection has no target.
    Finish,
}

impl StepTransition {
    pub fn for_step(step: &JourneyStep) -> Self {
        let first = step.connections_from_this_step.first();
        match (step.step_type, first.map(|c| c.target())) {
            (StepType::Channel, Some(_)) => Self::ExecuteThenRuleCheck,
            (StepType::Channel, None) => Self::ExecuteThenFinish,
            (_, Some(Some(target))) => Self::PassThrough { target },
            (_, Some(None) | None) => Self::Finish,
        }
    }

    pub fn executes(&self) -> bool {
        matches!(self, Self::ExecuteThenRuleCheck | Self::ExecuteThenFinish)
    }
}

/// Outcome of one rule-check delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCheckTransition {
    /// A connection passed: record its action and advance.
    Advance(BranchDecision),
    /// Nothing passed yet; re-check after the back-off.
    Defer,
    /// Nothing passed and the attempt bound is reached.
    Exhausted,
    /// The step lost its connections since the check was queued.
    Finish,
}

impl RuleCheckTransition {
    /// `attempt` counts the deferrals already made for this check.
    pub fn decide(
        has_connections: bool,
        decision: Option<BranchDecision>,
        attempt: u32,
        max_attempts: Option<u32>,
    ) -> Self {
        if !has_connections {
            return Self::Finish;
        }
        match (decision, max_attempts) {
            (Some(decision), _) => Self::Advance(decision),
            (None, Some(max)) if attempt >= max => Self::Exhausted,
            (None, _) => Self::Defer,
        }
    }
}
