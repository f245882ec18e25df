use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{SignalingError, SignalingRelay, Subscription, SubscriptionEvent};

/// In-process relay with ntfy delivery semantics: every live subscriber of a
/// topic, the publisher included, receives each message.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<MemoryRelayState>>,
}

#[derive(Debug, Default)]
struct MemoryRelayState {
    subscribers: HashMap<String, Vec<mpsc::Sender<SubscriptionEvent>>>,
    published: Vec<(String, String)>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(topic, message)` published so far.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state().published.clone()
    }

    /// Live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut state = self.state();
        match state.subscribers.get_mut(topic) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryRelayState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), SignalingError> {
        let mut state = self.state();
        state
            .published
            .push((topic.to_string(), message.to_string()));
        if let Some(senders) = state.subscribers.get_mut(topic) {
            senders.retain(|tx| {
                !matches!(
                    tx.try_send(SubscriptionEvent::Message(message.to_string())),
                    Err(mpsc::error::TrySendError::Closed(_))
                )
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::channel(256);
        self.state()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_includes_publisher() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("t").await.unwrap();
        let mut b = relay.subscribe("t").await.unwrap();
        let mut other = relay.subscribe("u").await.unwrap();

        relay.publish("t", "hello").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");

        relay.publish("u", "elsewhere").await.unwrap();
        assert_eq!(other.recv().await.unwrap(), "elsewhere");
        assert_eq!(relay.published().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribed_receivers_are_pruned() {
        let relay = MemoryRelay::new();
        let mut sub = relay.subscribe("t").await.unwrap();
        assert_eq!(relay.subscriber_count("t"), 1);
        sub.unsubscribe();
        assert_eq!(relay.subscriber_count("t"), 0);
        relay.publish("t", "nobody listening").await.unwrap();
    }
}
