//! Exchange and queue topology.
//!
//! Two domains, each a delayed-message exchange bound to durable queues by
//! routing key = queue name. Every queue dead-letters into `{queue}_DLX`,
//! which is a terminal sink with no further routing.

use journey_core::config::BrokerConfig;

/// Exchange type provided by the delayed-message plugin.
pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

/// Header carrying the per-message delay in milliseconds.
pub const DELAY_HEADER: &str = "x-delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Journey,
    Trigger,
}

impl Domain {
    pub fn queues(&self) -> &'static [Queue] {
        match self {
            Domain::Journey => &[Queue::Journey, Queue::Job, Queue::RuleCheck, Queue::Delayed],
            Domain::Trigger => &[Queue::Trigger],
        }
    }

    /// Journey-domain publishes carry the idempotency key as message id.
    pub fn sets_message_id(&self) -> bool {
        matches!(self, Domain::Journey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// One scan job per active journey.
    Journey,
    /// Immediate step execution.
    Job,
    /// Branch evaluation after a step ran.
    RuleCheck,
    /// Timed steps and deferred rule checks.
    Delayed,
    /// Webhook events.
    Trigger,
}

impl Queue {
    pub const ALL: [Queue; 5] = [
        Queue::Journey,
        Queue::Job,
        Queue::RuleCheck,
        Queue::Delayed,
        Queue::Trigger,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Queue::Journey => "journey",
            Queue::Job => "job",
            Queue::RuleCheck => "ruleCheck",
            Queue::Delayed => "delayed",
            Queue::Trigger => "trigger",
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Queue::Trigger => Domain::Trigger,
            _ => Domain::Journey,
        }
    }

    pub fn dead_letter(&self) -> String {
        format!("{}_DLX", self.name())
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One durable queue, its binding and its dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub queue: Queue,
    pub exchange: String,
    pub routing_key: String,
    pub dead_letter_queue: String,
}

/// Names of both exchanges. Declaring the same topology twice is a no-op on
/// the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub journey_exchange: String,
    pub trigger_exchange: String,
}

impl Topology {
    pub fn new(journey_exchange: impl Into<String>, trigger_exchange: impl Into<String>) -> Self {
        Self {
            journey_exchange: journey_exchange.into(),
            trigger_exchange: trigger_exchange.into(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.journey_exchange, &config.trigger_exchange)
    }

    pub fn exchange(&self, domain: Domain) -> &str {
        match domain {
            Domain::Journey => &self.journey_exchange,
            Domain::Trigger => &self.trigger_exchange,
        }
    }

    pub fn domains(&self) -> [Domain; 2] {
        [Domain::Journey, Domain::Trigger]
    }

    pub fn declarations(&self) -> Vec<QueueDeclaration> {
        self.domains()
            .iter()
            .flat_map(|domain| domain.queues().iter())
            .map(|queue| QueueDeclaration {
                queue: *queue,
                exchange: self.exchange(queue.domain()).to_string(),
                routing_key: queue.name().to_string(),
                dead_letter_queue: queue.dead_letter(),
            })
            .collect()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
