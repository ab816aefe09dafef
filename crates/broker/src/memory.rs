//! In-process broker for tests.
//!
//! Published messages are queued per queue and handed to the attached
//! handler only when a test calls [`MemoryBroker::dispatch`] or
//! [`MemoryBroker::drain`]. Delays are recorded but never waited on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    BrokerClient, BrokerError, BrokerResult, Delivery, MessageHandler, OutboundMessage, Outcome,
};
use crate::topology::Queue;

#[derive(Default)]
struct State {
    setup: bool,
    fail_on_publish: bool,
    published: Vec<OutboundMessage>,
    pending: HashMap<Queue, VecDeque<OutboundMessage>>,
    handlers: HashMap<Queue, Arc<dyn MessageHandler>>,
    dead_letters: HashMap<Queue, Vec<Delivery>>,
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_setup(&self) -> bool {
        self.state.lock().setup
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state.lock().fail_on_publish = fail;
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, queue: Queue) -> Vec<OutboundMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.state.lock().published.clear();
    }

    pub fn pending(&self, queue: Queue) -> usize {
        self.state.lock().pending.get(&queue).map_or(0, VecDeque::len)
    }

    pub fn dead_letters(&self, queue: Queue) -> Vec<Delivery> {
        self.state
            .lock()
            .dead_letters
            .get(&queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Hands the oldest pending message on `queue` to its handler.
    /// Returns `None` when the queue is empty or has no consumer.
    pub async fn dispatch(&self, queue: Queue) -> Option<Outcome> {
        let (message, handler) = {
            let mut state = self.state.lock();
            let handler = state.handlers.get(&queue)?.clone();
            let message = state.pending.get_mut(&queue)?.pop_front()?;
            (message, handler)
        };

        let delivery = Delivery {
            queue,
            payload: message.payload,
            message_id: message.message_id,
        };
        let outcome = handler.handle(delivery.clone()).await;

        if !outcome.is_ack() {
            self.state
                .lock()
                .dead_letters
                .entry(queue)
                .or_default()
                .push(delivery);
        }
        Some(outcome)
    }

    /// Dispatches until every consumed queue is empty or `limit` deliveries
    /// were handled. Returns the number handled.
    pub async fn drain(&self, limit: usize) -> usize {
        let mut handled = 0;
        while handled < limit {
            let mut progressed = false;
            for queue in Queue::ALL {
                if handled >= limit {
                    break;
                }
                if self.dispatch(queue).await.is_some() {
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        handled
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn setup(&self) -> BrokerResult<()> {
        let mut state = self.state.lock();
        state.setup = true;
        for queue in Queue::ALL {
            state.pending.entry(queue).or_default();
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if state.fail_on_publish {
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }
        if !state.setup {
            return Err(BrokerError::Publish(format!(
                "Exchange for {} not declared",
                message.queue
            )));
        }
        state.published.push(message.clone());
        state.pending.entry(message.queue).or_default().push_back(message);
        Ok(())
    }

    async fn consume(&self, queue: Queue, handler: Arc<dyn MessageHandler>) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if !state.setup {
            return Err(BrokerError::Consume(format!("Queue {queue} not declared")));
        }
        state.handlers.insert(queue, handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _delivery: Delivery) -> Outcome {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                Outcome::reject("bad payload")
            } else {
                Outcome::Ack
            }
        }
    }

    fn counting(reject: bool) -> Arc<Counting> {
        Arc::new(Counting {
            seen: AtomicUsize::new(0),
            reject,
        })
    }

    #[tokio::test]
    async fn test_publish_requires_setup() {
        let broker = MemoryBroker::new();
        let result = broker
            .publish(OutboundMessage::new(Queue::Job, b"{}".to_vec()))
            .await;
        assert!(result.is_err());

        broker.setup().await.unwrap();
        broker
            .publish(OutboundMessage::new(Queue::Job, b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.pending(Queue::Job), 1);
    }

    #[tokio::test]
    async fn test_dispatch_acks_and_dead_letters() {
        let broker = MemoryBroker::new();
        broker.setup().await.unwrap();
        let ok = counting(false);
        let bad = counting(true);
        broker.consume(Queue::Job, ok.clone()).await.unwrap();
        broker.consume(Queue::Delayed, bad.clone()).await.unwrap();

        broker
            .publish(OutboundMessage::new(Queue::Job, b"1".to_vec()))
            .await
            .unwrap();
        broker
            .publish(OutboundMessage::new(Queue::Delayed, b"2".to_vec()).with_message_id("k"))
            .await
            .unwrap();

        assert_eq!(broker.drain(10).await, 2);
        assert_eq!(ok.seen.load(Ordering::SeqCst), 1);
        assert_eq!(bad.seen.load(Ordering::SeqCst), 1);
        assert!(broker.dead_letters(Queue::Job).is_empty());

        let dead = broker.dead_letters(Queue::Delayed);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn test_dispatch_without_consumer_leaves_message() {
        let broker = MemoryBroker::new();
        broker.setup().await.unwrap();
        broker
            .publish(OutboundMessage::new(Queue::Trigger, b"{}".to_vec()))
            .await
            .unwrap();

        assert!(broker.dispatch(Queue::Trigger).await.is_none());
        assert_eq!(broker.pending(Queue::Trigger), 1);
    }
}
