//! Journey orchestration: moves contacts through journeys of channel, wait
//! and trigger steps, branching on remotely evaluated rules.

#![warn(clippy::unwrap_used)]

pub mod consumers;
pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod scheduler;
pub mod state_machine;
pub mod types;

pub use consumers::{attach_all, Consumer, ConsumerAdapter};
pub use dispatcher::Dispatcher;
pub use engine::{EngineSettings, JourneyEngine};
pub use evaluator::RuleEngine;
pub use scheduler::{Scheduler, TickReport};
pub use types::{Handled, NewJob, StepRef};
