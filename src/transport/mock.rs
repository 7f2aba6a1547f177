use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Broker, Subscription};
use crate::error::{Error, Result};

/// A publish observed by the mock broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Scripted device behavior: publish `payload` on `topic` some time after
/// `trigger_payload` is seen on `trigger_topic`.
struct Reply {
    trigger_topic: String,
    trigger_payload: Bytes,
    topic: String,
    payload: Bytes,
    delay: Duration,
}

#[derive(Default)]
struct MockState {
    connected: bool,
    closed: bool,
    fail_connect: bool,
    fail_subscribe: bool,
    failing_payloads: Vec<Bytes>,
    connect_attempts: usize,
    attempts: Vec<Published>,
    published: Vec<Published>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    subscribe_count: usize,
    unsubscribe_count: usize,
    replies: Vec<Reply>,
}

/// In-memory broker for exercising the handshake without a network.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(self) -> Self {
        self.state().fail_connect = true;
        self
    }

    pub fn fail_subscribe(self) -> Self {
        self.state().fail_subscribe = true;
        self
    }

    /// Rejects every publish carrying `payload`.
    pub fn fail_publish(self, payload: &[u8]) -> Self {
        self.state()
            .failing_payloads
            .push(Bytes::copy_from_slice(payload));
        self
    }

    pub fn reply_to(
        self,
        trigger_topic: &str,
        trigger_payload: &[u8],
        topic: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Self {
        self.state().replies.push(Reply {
            trigger_topic: trigger_topic.to_string(),
            trigger_payload: Bytes::copy_from_slice(trigger_payload),
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            delay,
        });
        self
    }

    /// Delivers a message to the current subscriber of `topic`, if any.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let state = self.state();
        match state.subscribers.get(topic) {
            Some(tx) => tx.send(Bytes::copy_from_slice(payload)).is_ok(),
            None => false,
        }
    }

    /// Drops every subscriber channel, as a lost connection would.
    pub fn drop_connection(&self) {
        let mut state = self.state();
        state.connected = false;
        state.subscribers.clear();
    }

    /// Successful publishes, in order.
    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Every publish attempt, failed ones included.
    pub fn publish_attempts(&self) -> Vec<Published> {
        self.state().attempts.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn subscribe_count(&self) -> usize {
        self.state().subscribe_count
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribe_count
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule_replies(&self, topic: &str, payload: &[u8]) {
        let state = self.state();
        for reply in state
            .replies
            .iter()
            .filter(|r| r.trigger_topic == topic && r.trigger_payload == payload)
        {
            let broker = self.clone();
            let topic = reply.topic.clone();
            let payload = reply.payload.clone();
            let delay = reply.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                broker.deliver(&topic, &payload);
            });
        }
    }
}

impl Broker for MockBroker {
    type Subscription = MockSubscription;

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.fail_connect {
            return Err(Error::Transport("Connection refused".to_string()));
        }
        state.connected = true;
        state.closed = false;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<MockSubscription> {
        let mut state = self.state();
        if !state.connected {
            return Err(Error::Transport("Not connected".to_string()));
        }
        if state.fail_subscribe {
            return Err(Error::Transport(format!("Subscription to {topic} rejected")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(topic.to_string(), tx);
        state.subscribe_count += 1;

        Ok(MockSubscription {
            topic: topic.to_string(),
            rx,
            broker: self.clone(),
        })
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let message = Published {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            retain,
        };

        {
            let mut state = self.state();
            state.attempts.push(message.clone());
            if !state.connected {
                return Err(Error::Transport("Not connected".to_string()));
            }
            if state.failing_payloads.iter().any(|p| p == payload) {
                return Err(Error::Transport(format!("Publish to {topic} failed")));
            }
            state.published.push(message);
        }

        self.schedule_replies(topic, payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.connected = false;
        state.closed = true;
        state.subscribers.clear();
        Ok(())
    }
}

pub struct MockSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    broker: MockBroker,
}

impl Subscription for MockSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for MockSubscription {
    fn drop(&mut self) {
        let mut state = self.broker.state();
        state.subscribers.remove(&self.topic);
        state.unsubscribe_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_subscriber_until_dropped() {
        let mut broker = MockBroker::new();
        broker.connect().await.unwrap();

        let mut sub = broker.subscribe("home/a/ota").await.unwrap();
        assert!(broker.deliver("home/a/ota", b"READY"));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"READY"));

        drop(sub);
        assert!(!broker.deliver("home/a/ota", b"READY"));
        assert_eq!(broker.unsubscribe_count(), 1);
        assert_eq!(broker.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn failed_publishes_are_attempted_but_not_recorded() {
        let mut broker = MockBroker::new().fail_publish(b"ON");
        broker.connect().await.unwrap();

        assert!(broker.publish("t", b"ON", true).await.is_err());
        assert!(broker.publish("t", b"OFF", true).await.is_ok());

        assert_eq!(broker.publish_attempts().len(), 2);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let mut broker = MockBroker::new();
        assert!(broker.subscribe("t").await.is_err());
        assert!(broker.publish("t", b"ON", false).await.is_err());
    }
}
