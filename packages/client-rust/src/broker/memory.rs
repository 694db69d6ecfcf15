//! In-process broker delivering to channel subscribers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Broker, BrokerError, BrokerMessage};

/// Broker that fans each publication out to the live subscribers of its
/// topic. Publishing before `connect` fails.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    connected: AtomicBool,
    connects: AtomicUsize,
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<BrokerMessage>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives every message published to `topic` from now on.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<BrokerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Number of times `connect` was called.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(BrokerError::NotConnected);
        }
        if let Some(mut subscribers) = self.subscribers.get_mut(topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_requires_connect() {
        let broker = MemoryBroker::new();
        assert_eq!(
            broker.publish("t", BrokerMessage::default()).await,
            Err(BrokerError::NotConnected)
        );
    }

    #[tokio::test]
    async fn subscribers_receive_their_topic_only() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let mut events = broker.subscribe("events");
        let mut other = broker.subscribe("other");

        let msg = BrokerMessage {
            body: b"hello".to_vec(),
            ..BrokerMessage::default()
        };
        broker.publish("events", msg.clone()).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), msg);
        assert!(other.try_recv().is_err());
        assert_eq!(broker.connect_count(), 1);
    }
}
