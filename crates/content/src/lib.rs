//! Collaborators the engine calls out to: the content store holding
//! journeys and contacts, the remote rule evaluator and the channel sender.

#![warn(clippy::unwrap_used)]

pub mod http;
pub mod memory;
pub mod remote;
pub mod store;

pub use http::HttpContentStore;
pub use memory::{MemoryContentStore, MemoryRuleEvaluator, MemorySender};
pub use remote::{HttpRuleEvaluator, HttpSender};
pub use store::{ContentStore, RuleEvaluator, StepSender};
