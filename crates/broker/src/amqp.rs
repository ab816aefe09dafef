//! AMQP (RabbitMQ) broker using the delayed-message exchange plugin.
//!
//! One connection and one channel per process, shared by every publisher
//! and consumer. Publisher confirms are enabled so a publish only succeeds
//! once the broker has taken the persistent message.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use journey_core::config::BrokerConfig;

use crate::client::{
    BrokerClient, BrokerError, BrokerResult, Delivery, MessageHandler, OutboundMessage, Outcome,
};
use crate::topology::{Queue, Topology, DELAYED_EXCHANGE_TYPE, DELAY_HEADER};

/// A consumer whose delivery stream ended. Its queue is no longer served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStopped {
    pub queue: Queue,
    pub reason: String,
}

pub struct AmqpBroker {
    // Dropping the connection closes the channel.
    _connection: Connection,
    channel: Channel,
    topology: Topology,
    consumer_prefix: String,
    stopped: mpsc::UnboundedSender<ConsumerStopped>,
}

impl AmqpBroker {
    /// Connects and opens the shared channel.
    pub async fn connect(config: &BrokerConfig) -> BrokerResult<Self> {
        info!(url = %redact(&config.url), "Connecting to RabbitMQ");

        let properties =
            ConnectionProperties::default().with_connection_name(config.connection_name.clone().into());
        let connection = Connection::connect(&config.url, properties)
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {e}")))?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to set prefetch: {e}")))?;

        info!(prefetch = config.prefetch, "RabbitMQ channel open");

        let (stopped, _) = mpsc::unbounded_channel();
        Ok(Self {
            _connection: connection,
            channel,
            topology: Topology::from_config(config),
            consumer_prefix: config.connection_name.clone(),
            stopped,
        })
    }

    /// Receives one notice per consumer whose stream ends. Replaces any
    /// earlier receiver, so take it before attaching consumers.
    pub fn consumer_failures(&mut self) -> mpsc::UnboundedReceiver<ConsumerStopped> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stopped = tx;
        rx
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn handle_delivery(
        queue: Queue,
        delivery: lapin::message::Delivery,
        handler: Arc<dyn MessageHandler>,
    ) {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        let outcome = handler
            .handle(Delivery {
                queue,
                payload: delivery.data.clone(),
                message_id: message_id.clone(),
            })
            .await;

        let result = match &outcome {
            Outcome::Ack => delivery.ack(BasicAckOptions::default()).await,
            Outcome::Reject { reason } => {
                warn!(
                    queue = %queue,
                    message_id = ?message_id,
                    reason = %reason,
                    "Rejecting message to dead-letter queue"
                );
                delivery
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await
            }
        };

        if let Err(e) = result {
            error!(queue = %queue, error = %e, "Failed to settle delivery");
        }
    }
}

/// Feeds deliveries to `on_delivery` until the stream fails or ends.
async fn pump<S, T, E, F>(queue: Queue, mut stream: S, mut on_delivery: F) -> ConsumerStopped
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: Display,
    F: FnMut(T),
{
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => on_delivery(delivery),
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer delivery error");
                return ConsumerStopped {
                    queue,
                    reason: e.to_string(),
                };
            }
        }
    }
    ConsumerStopped {
        queue,
        reason: "delivery stream closed".to_string(),
    }
}

fn queue_arguments(dead_letter_queue: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dead_letter_queue.into()),
    );
    args
}

fn exchange_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
    args
}

/// Strips credentials from a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}

#[async_trait]
impl BrokerClient for AmqpBroker {
    async fn setup(&self) -> BrokerResult<()> {
        for domain in self.topology.domains() {
            let exchange = self.topology.exchange(domain);
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.to_string()),
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        ..Default::default()
                    },
                    exchange_arguments(),
                )
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!("Failed to declare exchange {exchange}: {e}"))
                })?;
        }

        for decl in self.topology.declarations() {
            let durable = QueueDeclareOptions {
                durable: true,
                ..Default::default()
            };

            self.channel
                .queue_declare(
                    decl.queue.name(),
                    durable,
                    queue_arguments(&decl.dead_letter_queue),
                )
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!("Failed to declare queue {}: {e}", decl.queue))
                })?;

            self.channel
                .queue_declare(&decl.dead_letter_queue, durable, FieldTable::default())
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!(
                        "Failed to declare queue {}: {e}",
                        decl.dead_letter_queue
                    ))
                })?;

            self.channel
                .queue_bind(
                    decl.queue.name(),
                    &decl.exchange,
                    &decl.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BrokerError::Topology(format!("Failed to bind queue {}: {e}", decl.queue))
                })?;

            debug!(
                queue = %decl.queue,
                exchange = %decl.exchange,
                dead_letter = %decl.dead_letter_queue,
                "Queue declared"
            );
        }

        info!(
            journey_exchange = %self.topology.journey_exchange,
            trigger_exchange = %self.topology.trigger_exchange,
            "RabbitMQ topology initialized"
        );
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> BrokerResult<()> {
        let mut headers = FieldTable::default();
        headers.insert(DELAY_HEADER.into(), AMQPValue::LongLongInt(message.delay_ms()));

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);
        if let Some(id) = &message.message_id {
            properties = properties.with_message_id(id.as_str().into());
        }

        let exchange = self.topology.exchange(message.queue.domain());
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                message.queue.name(),
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {e}")))?;

        confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {e}")))?;

        debug!(
            queue = %message.queue,
            delay_ms = message.delay_ms(),
            message_id = ?message.message_id,
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, queue: Queue, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        let tag = format!("{}-{}", self.consumer_prefix, queue.name());
        let consumer = self
            .channel
            .basic_consume(
                queue.name(),
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer on {queue}: {e}")))?;

        info!(queue = %queue, consumer_tag = %tag, "Consumer attached");

        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            let notice = pump(queue, consumer, |delivery: lapin::message::Delivery| {
                let span = tracing::info_span!(
                    "consume",
                    queue = %queue,
                    message_id = ?delivery.properties.message_id()
                );
                tokio::spawn(
                    Self::handle_delivery(queue, delivery, handler.clone()).instrument(span),
                );
            })
            .await;
            error!(queue = %queue, reason = %notice.reason, "Consumer stopped");
            if stopped.send(notice).is_err() {
                warn!(queue = %queue, "Nobody is watching for stopped consumers");
            }
        });

        Ok(())
    }
}


/// Integration tests requiring a running RabbitMQ with the delayed-message plugin.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test -p journey-broker -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::Sender<Delivery>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, delivery: Delivery) -> Outcome {
            let _ = self.0.send(delivery).await;
            Outcome::Ack
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_setup_is_idempotent_and_round_trips() {
        let config = BrokerConfig {
            url: std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".into()),
            ..BrokerConfig::default()
        };
        let broker = AmqpBroker::connect(&config).await.expect("connect");
        broker.setup().await.expect("first setup");
        broker.setup().await.expect("second setup");

        let (tx, mut rx) = mpsc::channel(1);
        broker.consume(Queue::Job, Arc::new(Forward(tx))).await.unwrap();
        broker
            .publish(OutboundMessage::new(Queue::Job, b"{}".to_vec()).with_message_id("it-1"))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.message_id.as_deref(), Some("it-1"));
    }
}
