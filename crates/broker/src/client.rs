//! Broker-client interface shared by every component that publishes or
//! consumes. Implementations: `AmqpBroker` (RabbitMQ) and `MemoryBroker`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use journey_core::JourneyError;

use crate::topology::{Domain, Queue};

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),
}

impl From<BrokerError> for JourneyError {
    fn from(err: BrokerError) -> Self {
        JourneyError::Broker(err.to_string())
    }
}

/// A message to publish. Always persistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub queue: Queue,
    pub payload: Vec<u8>,
    /// Zero delivers immediately.
    pub delay: Duration,
    pub message_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(queue: Queue, payload: Vec<u8>) -> Self {
        Self {
            queue,
            payload,
            delay: Duration::ZERO,
            message_id: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only journey-domain messages carry an id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        if self.queue.domain() == Domain::Journey {
            self.message_id = Some(id.into());
        }
        self
    }

    pub fn delay_ms(&self) -> i64 {
        i64::try_from(self.delay.as_millis()).unwrap_or(i64::MAX)
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: Queue,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
}

/// How a handler finished with a delivery. The adapter acks `Ack` and
/// nacks `Reject` without requeue, which routes it to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Reject { reason: String },
}

impl Outcome {
    pub fn reject(reason: impl Into<String>) -> Self {
        Outcome::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Outcome::Ack)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Outcome;
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Declares both exchanges, all queues and their dead-letter queues.
    /// Must complete before any consumer attaches.
    async fn setup(&self) -> BrokerResult<()>;

    async fn publish(&self, message: OutboundMessage) -> BrokerResult<()>;

    /// Attaches `handler` to `queue`. Each delivery is handled on its own task.
    async fn consume(&self, queue: Queue, handler: Arc<dyn MessageHandler>) -> BrokerResult<()>;
}
