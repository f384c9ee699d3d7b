//! In-process event bus.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use fleetd_common::{Error, Result};

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Topic the message was published on.
    pub topic: String,
    /// Encoded payload.
    pub message: Vec<u8>,
}

/// Capability to publish messages on a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `message` on `topic`.
    ///
    /// Publishing on a topic nobody listens to is not an error.
    ///
    /// # Errors
    /// - The bus has been closed
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()>;
}

/// Event bus with one bounded queue per subscriber.
///
/// A full queue makes `publish` wait until the subscriber catches up;
/// messages are never dropped for a live subscriber.
pub struct EventBus {
    capacity: usize,
    topics: RwLock<Option<HashMap<String, Vec<mpsc::Sender<Event>>>>>,
}

impl EventBus {
    /// Create a new event bus; `capacity` bounds how many messages may wait
    /// in one subscriber's queue before publishers block.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(Some(HashMap::new())),
        }
    }

    /// Subscribe to a topic.
    ///
    /// Only messages published after this call are delivered.
    pub fn subscribe(&self, name: &str, topic: &str) -> Result<Subscription> {
        let mut guard = self
            .topics
            .write()
            .map_err(|_| Error::Publish("event bus lock poisoned".to_string()))?;
        let topics = guard
            .as_mut()
            .ok_or_else(|| Error::Publish("event bus is closed".to_string()))?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let senders = topics.entry(topic.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        debug!("{} subscribed to {}", name, topic);
        Ok(Subscription {
            name: name.to_string(),
            rx,
        })
    }

    /// Close the bus: further publishes fail and every subscription ends
    /// once it has drained what was already sent.
    pub fn close(&self) {
        if let Ok(mut guard) = self.topics.write() {
            guard.take();
        }
    }

    fn senders(&self, topic: &str) -> Result<Vec<mpsc::Sender<Event>>> {
        let guard = self
            .topics
            .read()
            .map_err(|_| Error::Publish("event bus lock poisoned".to_string()))?;
        let topics = guard
            .as_ref()
            .ok_or_else(|| Error::Publish("event bus is closed".to_string()))?;
        Ok(topics.get(topic).cloned().unwrap_or_default())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Publisher for EventBus {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()> {
        let event = Event {
            topic: topic.to_string(),
            message,
        };
        for tx in self.senders(topic)? {
            // A dropped subscription has nothing left to deliver to.
            if tx.send(event.clone()).await.is_err() {
                debug!("Skipping closed subscription on {}", topic);
            }
        }
        Ok(())
    }
}

/// Receiving end of a topic subscription.
pub struct Subscription {
    name: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next message; `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Subscriber name given at subscribe time.
    pub fn name(&self) -> &str {
        &self.name
    }
}
