#![warn(clippy::unwrap_used)]

pub mod amqp;
pub mod client;
pub mod memory;
pub mod topology;

pub use amqp::{AmqpBroker, ConsumerStopped};
pub use client::{
    BrokerClient, BrokerError, BrokerResult, Delivery, MessageHandler, OutboundMessage, Outcome,
};
pub use memory::MemoryBroker;
pub use topology::{Domain, Queue, Topology};
