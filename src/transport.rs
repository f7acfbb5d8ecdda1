//! Pub/sub boundary. The core never talks to a broker directly; everything
//! goes through [`Transport`]. [`MemoryTransport`] is a loopback broker used
//! by tests and embedders; `mqtt::MqttTransport` is the network one.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::topic::topic_matches;

/// Buffered inbound messages before the producer waits.
pub const STREAM_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

pub type MessageStream = mpsc::Receiver<InboundMessage>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// The one feed carrying every subscribed message, in broker order.
    /// Only the first call gets it.
    fn take_messages(&self) -> Option<MessageStream>;

    /// Start delivering messages matching `filter` (MQTT wildcards).
    async fn subscribe(&self, filter: &str) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;
}

/// Active filters and the single feed matching messages are forwarded to.
pub struct SubscriptionTable {
    filters: DashSet<String>,
    feed: mpsc::Sender<InboundMessage>,
    stream: Mutex<Option<MessageStream>>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        let (feed, stream) = mpsc::channel(STREAM_CAPACITY);
        Self {
            filters: DashSet::new(),
            feed,
            stream: Mutex::new(Some(stream)),
        }
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_stream(&self) -> Option<MessageStream> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Returns false when `filter` was already active.
    pub fn add(&self, filter: &str) -> bool {
        self.filters.insert(filter.to_string())
    }

    /// Returns false when nothing was subscribed to `filter`.
    pub fn remove(&self, filter: &str) -> bool {
        self.filters.remove(filter).is_some()
    }

    pub fn filters(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.key().clone()).collect()
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| topic_matches(topic, f.key()))
    }

    /// Forward `message` once when any filter matches. Overlapping filters
    /// never duplicate it.
    pub async fn dispatch(&self, message: InboundMessage) -> bool {
        if !self.matches(&message.topic) {
            return false;
        }
        self.forward(message).await
    }

    /// Forward without a filter check.
    pub async fn forward(&self, message: InboundMessage) -> bool {
        self.feed.send(message).await.is_ok()
    }
}

/// In-process broker: retained store, loopback delivery and a publish log.
#[derive(Default)]
pub struct MemoryTransport {
    subscriptions: SubscriptionTable,
    retained: DashMap<String, Vec<u8>>,
    published: Mutex<Vec<InboundMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message as if a device had published it.
    pub async fn inject(&self, topic: &str, payload: &[u8], retain: bool) {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        };
        if retain {
            self.store_retained(&message);
        }
        self.subscriptions
            .dispatch(InboundMessage {
                retain: false,
                ..message
            })
            .await;
    }

    /// Everything published through [`Transport::publish`], oldest first.
    pub fn published(&self) -> Vec<InboundMessage> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.get(topic).map(|e| e.value().clone())
    }

    fn store_retained(&self, message: &InboundMessage) {
        if message.payload.is_empty() {
            self.retained.remove(&message.topic);
        } else {
            self.retained
                .insert(message.topic.clone(), message.payload.clone());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn take_messages(&self) -> Option<MessageStream> {
        self.subscriptions.take_stream()
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        if !self.subscriptions.add(filter) {
            return Ok(());
        }

        let retained: Vec<InboundMessage> = self
            .retained
            .iter()
            .filter(|e| topic_matches(e.key(), filter))
            .map(|e| InboundMessage {
                topic: e.key().clone(),
                payload: e.value().clone(),
                retain: true,
            })
            .collect();
        for message in retained {
            self.subscriptions.forward(message).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.remove(filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        };
        tracing::debug!("publish: {} ({} bytes)", topic, payload.len());
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        self.inject(topic, payload, retain).await;
        Ok(())
    }
}
