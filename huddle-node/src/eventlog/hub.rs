//! Node-local topic fan-out
//!
//! One [`EventBus`] per topic that has at least one local subscriber. The hub
//! is a reconstructable cache: losing it loses nothing, because every
//! consumer can re-read the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use huddle_common::events::{Event, EventBus, Topic};

/// What a subscription yields
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Event(Event),
    /// The local buffer overflowed and `skipped` events were dropped;
    /// the consumer must catch up from the log
    Lagged(u64),
}

#[derive(Default)]
struct HubInner {
    topics: Mutex<HashMap<Topic, EventBus>>,
}

impl HubInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<Topic, EventBus>> {
        // A poisoned map is still structurally valid
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct TopicHub {
    inner: Arc<HubInner>,
    buffer: usize,
}

impl TopicHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner::default()),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, topic: &Topic) -> Subscription {
        let rx = self
            .inner
            .topics()
            .entry(topic.clone())
            .or_insert_with(|| EventBus::new(self.buffer))
            .subscribe();
        debug!("Subscribed to {}", topic);
        Subscription {
            topic: topic.clone(),
            rx: Some(rx),
            hub: Arc::clone(&self.inner),
        }
    }

    /// Hand an event to local subscribers; returns how many received it
    pub fn dispatch(&self, topic: &Topic, event: &Event) -> usize {
        let topics = self.inner.topics();
        match topics.get(topic) {
            Some(bus) => bus.emit(event.clone()).unwrap_or(0),
            None => 0,
        }
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics()
            .get(topic)
            .map_or(0, EventBus::subscriber_count)
    }
}

/// Live feed of one topic on this node
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    topic: Topic,
    rx: Option<broadcast::Receiver<Event>>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }

    /// Next event, or `None` once cancelled
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await {
            Ok(event) => Some(SubscriptionEvent::Event(event)),
            Err(RecvError::Lagged(skipped)) => Some(SubscriptionEvent::Lagged(skipped)),
            Err(RecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }

    /// Unsubscribe immediately; safe to call repeatedly
    pub fn cancel(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        let mut topics = self.hub.topics();
        if topics
            .get(&self.topic)
            .is_some_and(|bus| bus.subscriber_count() == 0)
        {
            topics.remove(&self.topic);
            debug!("Dropped idle topic {}", self.topic);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::ids::{TenantId, UserId};

    fn topic(user: &str) -> Topic {
        Topic::new(TenantId::new("acme"), UserId::new(user))
    }

    fn event(id: u64) -> Event {
        Event {
            id,
            event_type: "Ping".into(),
            payload: serde_json::json!({}),
            origin_node: "node-a".into(),
            timestamp: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_matching_topic() {
        let hub = TopicHub::new(8);
        let mut alice = hub.subscribe(&topic("alice"));
        let _bob = hub.subscribe(&topic("bob"));

        let sent = event(1);
        assert_eq!(hub.dispatch(&topic("alice"), &sent), 1);
        assert_eq!(hub.dispatch(&topic("carol"), &sent), 0);
        assert_eq!(alice.recv().await, Some(SubscriptionEvent::Event(sent)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_drops_topic() {
        let hub = TopicHub::new(8);
        let mut sub = hub.subscribe(&topic("alice"));
        assert_eq!(hub.topic_count(), 1);

        sub.cancel();
        sub.cancel();
        assert!(sub.is_cancelled());
        assert_eq!(hub.topic_count(), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_topic_survives_while_other_subscribers_remain() {
        let hub = TopicHub::new(8);
        let first = hub.subscribe(&topic("alice"));
        let _second = hub.subscribe(&topic("alice"));
        drop(first);
        assert_eq!(hub.topic_count(), 1);
        assert_eq!(hub.subscriber_count(&topic("alice")), 1);
    }

    #[tokio::test]
    async fn test_overflow_reports_lag() {
        let hub = TopicHub::new(2);
        let mut sub = hub.subscribe(&topic("alice"));
        for id in 1..=5 {
            hub.dispatch(&topic("alice"), &event(id));
        }
        assert!(matches!(sub.recv().await, Some(SubscriptionEvent::Lagged(_))));
    }
}
