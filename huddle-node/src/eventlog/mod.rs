//! Event Log & Fan-out
//!
//! `publish` appends to the per-user log first and only then attempts the
//! broadcast, so a lost broadcast never loses an event: consumers fall back
//! to `read_since`. Same-node subscribers are fed directly; other nodes pick
//! the event up through their [`LogTailer`].

mod hub;
mod tailer;

pub use hub::{Subscription, SubscriptionEvent, TopicHub};
pub use tailer::LogTailer;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use huddle_common::config::EventLogConfig;
use huddle_common::events::{CollabEvent, Event, NewEvent, Topic};
use huddle_common::ids::{TenantId, UserId};
use huddle_common::store::LogStore;
use huddle_common::Result;

/// Result of a cursor read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Events {
        events: Vec<Event>,
        /// Last id assigned in the log
        head: u64,
        /// More events past the returned page
        has_more: bool,
    },
    /// The event after the cursor was evicted; the client must refetch state
    Resync { oldest_available: u64, head: u64 },
}

pub struct EventLog {
    log: Arc<dyn LogStore>,
    hub: TopicHub,
    capacity: usize,
    node_id: String,
}

impl EventLog {
    pub fn new(log: Arc<dyn LogStore>, config: &EventLogConfig, node_id: impl Into<String>) -> Self {
        Self {
            log,
            hub: TopicHub::new(config.local_buffer),
            capacity: config.capacity,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn hub(&self) -> &TopicHub {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append to the user's log, then broadcast locally
    pub async fn publish(&self, topic: &Topic, event: NewEvent) -> Result<Event> {
        let stored = self
            .log
            .append(topic, event, &self.node_id, self.capacity)
            .await?;
        let delivered = self.hub.dispatch(topic, &stored);
        debug!(
            topic = %topic,
            event_id = stored.id,
            event_type = %stored.event_type,
            local_subscribers = delivered,
            "Published event"
        );
        Ok(stored)
    }

    /// Publish one event to several users of a tenant
    ///
    /// Every recipient is attempted; the first failure is returned after.
    pub async fn publish_many<'a>(
        &self,
        tenant: &TenantId,
        users: impl IntoIterator<Item = &'a UserId>,
        event: NewEvent,
    ) -> Result<Vec<Event>> {
        let mut published = Vec::new();
        let mut first_error = None;
        for user in users {
            let topic = Topic::new(tenant.clone(), user.clone());
            match self.publish(&topic, event.clone()).await {
                Ok(stored) => published.push(stored),
                Err(e) => {
                    warn!("Publish to {} failed: {}", topic, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(published),
        }
    }

    /// Notify an audience after a committed state change
    ///
    /// The state change stands even if notification fails; failures are logged.
    pub async fn notify<'a>(
        &self,
        tenant: &TenantId,
        users: impl IntoIterator<Item = &'a UserId>,
        event: &CollabEvent,
    ) {
        let new_event = match event.to_new_event() {
            Ok(e) => e,
            Err(e) => {
                warn!("Could not encode {}: {}", event.event_type(), e);
                return;
            }
        };
        if let Err(e) = self.publish_many(tenant, users, new_event).await {
            warn!(
                "Notification {} not fully delivered to logs: {}",
                event.event_type(),
                e
            );
        }
    }

    /// Events with id > `cursor`, or a resync signal if the next one was evicted
    pub async fn read_since(&self, topic: &Topic, cursor: u64, limit: usize) -> Result<ReadOutcome> {
        let limit = limit.max(1);
        // One extra row tells us whether more remain
        let slice = self.log.read_since(topic, cursor, limit + 1).await?;

        if let Some(oldest) = slice.oldest_id {
            if cursor.saturating_add(1) < oldest {
                return Ok(ReadOutcome::Resync {
                    oldest_available: oldest,
                    head: slice.head_id,
                });
            }
        } else if slice.head_id > cursor {
            // Everything past the cursor is gone
            return Ok(ReadOutcome::Resync {
                oldest_available: slice.head_id + 1,
                head: slice.head_id,
            });
        }

        let mut events = slice.events;
        let has_more = events.len() > limit;
        events.truncate(limit);
        Ok(ReadOutcome::Events {
            events,
            head: slice.head_id,
            has_more,
        })
    }

    /// Events newer than a wall-clock timestamp (short-poll `since=<time>`)
    ///
    /// The log keeps no timestamp for what it evicted, so this scans the
    /// retained window (at most `capacity` events) and resyncs whenever the
    /// oldest retained event is newer than `since` and something was evicted.
    /// That resync is conservative: it also fires when every evicted event
    /// predates `since`. Id cursors are exact and preferred.
    pub async fn read_since_time(
        &self,
        topic: &Topic,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReadOutcome> {
        let slice = self.log.read_since(topic, 0, self.capacity).await?;
        if let Some(oldest) = slice.events.first() {
            if oldest.id > 1 && oldest.timestamp > since {
                return Ok(ReadOutcome::Resync {
                    oldest_available: oldest.id,
                    head: slice.head_id,
                });
            }
        }
        let mut events: Vec<Event> = slice
            .events
            .into_iter()
            .filter(|e| e.timestamp > since)
            .collect();
        let has_more = events.len() > limit;
        events.truncate(limit);
        Ok(ReadOutcome::Events {
            events,
            head: slice.head_id,
            has_more,
        })
    }

    pub async fn head(&self, topic: &Topic) -> Result<u64> {
        self.log.head(topic).await
    }

    /// Live feed for this node; pair with `read_since` for catch-up
    pub fn subscribe(&self, topic: &Topic) -> Subscription {
        self.hub.subscribe(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn log_with_capacity(capacity: usize) -> EventLog {
        let config = EventLogConfig {
            capacity,
            ..EventLogConfig::default()
        };
        EventLog::new(Arc::new(MemoryStore::new()), &config, "node-a")
    }

    fn topic(user: &str) -> Topic {
        Topic::new(TenantId::new("acme"), UserId::new(user))
    }

    fn ids(outcome: &ReadOutcome) -> Vec<u64> {
        match outcome {
            ReadOutcome::Events { events, .. } => events.iter().map(|e| e.id).collect(),
            ReadOutcome::Resync { .. } => panic!("unexpected resync"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_local_subscriber_and_log() {
        let log = log_with_capacity(10);
        let mut sub = log.subscribe(&topic("alice"));

        let stored = log
            .publish(&topic("alice"), NewEvent::new("Ping", json!({ "n": 1 })))
            .await
            .unwrap();
        assert_eq!(stored.id, 1);
        assert_eq!(stored.origin_node, "node-a");

        assert_eq!(sub.recv().await, Some(SubscriptionEvent::Event(stored)));
        assert_eq!(ids(&log.read_since(&topic("alice"), 0, 10).await.unwrap()), vec![1]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_still_logs() {
        let log = log_with_capacity(10);
        log.publish(&topic("bob"), NewEvent::new("Ping", json!({})))
            .await
            .unwrap();
        assert_eq!(log.head(&topic("bob")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_since_pages_with_has_more() {
        let log = log_with_capacity(10);
        for _ in 0..5 {
            log.publish(&topic("alice"), NewEvent::new("Ping", json!({})))
                .await
                .unwrap();
        }
        match log.read_since(&topic("alice"), 1, 2).await.unwrap() {
            ReadOutcome::Events { events, head, has_more } => {
                assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
                assert_eq!(head, 5);
                assert!(has_more);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evicted_cursor_requires_resync() {
        let log = log_with_capacity(3);
        for _ in 0..6 {
            log.publish(&topic("alice"), NewEvent::new("Ping", json!({})))
                .await
                .unwrap();
        }
        // Oldest retained is 4; cursor 3 is still contiguous, cursor 2 is not
        assert_eq!(ids(&log.read_since(&topic("alice"), 3, 10).await.unwrap()), vec![4, 5, 6]);
        assert_eq!(
            log.read_since(&topic("alice"), 2, 10).await.unwrap(),
            ReadOutcome::Resync {
                oldest_available: 4,
                head: 6
            }
        );
    }

    #[tokio::test]
    async fn test_cursor_zero_on_fresh_log_is_valid() {
        let log = log_with_capacity(3);
        assert_eq!(ids(&log.read_since(&topic("nobody"), 0, 10).await.unwrap()), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn test_publish_many_fans_out_per_user() {
        let log = log_with_capacity(10);
        let users = [UserId::new("a"), UserId::new("b")];
        let published = log
            .publish_many(&TenantId::new("acme"), users.iter(), NewEvent::new("X", json!({})))
            .await
            .unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(log.head(&topic("a")).await.unwrap(), 1);
        assert_eq!(log.head(&topic("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_since_time_filters_by_timestamp() {
        let log = log_with_capacity(10);
        log.publish(&topic("alice"), NewEvent::new("Old", json!({})))
            .await
            .unwrap();
        let cut = chrono::Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        log.publish(&topic("alice"), NewEvent::new("New", json!({})))
            .await
            .unwrap();
        assert_eq!(ids(&log.read_since_time(&topic("alice"), cut, 10).await.unwrap()), vec![2]);
    }

    #[tokio::test]
    async fn test_read_since_time_resyncs_past_the_eviction_horizon() {
        let log = log_with_capacity(2);
        let before = chrono::Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        for _ in 0..2 {
            log.publish(&topic("alice"), NewEvent::new("Ping", json!({})))
                .await
                .unwrap();
        }
        let cut = chrono::Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        log.publish(&topic("alice"), NewEvent::new("Ping", json!({})))
            .await
            .unwrap();

        // Event 1 was evicted and may have been newer than `before`
        assert_eq!(
            log.read_since_time(&topic("alice"), before, 10).await.unwrap(),
            ReadOutcome::Resync {
                oldest_available: 2,
                head: 3
            }
        );
        // The retained window covers `cut`
        assert_eq!(ids(&log.read_since_time(&topic("alice"), cut, 10).await.unwrap()), vec![3]);
    }

    proptest! {
        #[test]
        fn prop_read_since_is_strictly_increasing_and_after_cursor(
            publishes in 1usize..40,
            capacity in 1usize..20,
            cursor in 0u64..45,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let log = log_with_capacity(capacity);
                for _ in 0..publishes {
                    log.publish(&topic("p"), NewEvent::new("X", json!({}))).await.unwrap();
                }
                match log.read_since(&topic("p"), cursor, 100).await.unwrap() {
                    ReadOutcome::Events { events, .. } => {
                        prop_assert!(events.iter().all(|e| e.id > cursor));
                        prop_assert!(events.windows(2).all(|w| w[0].id < w[1].id));
                    }
                    ReadOutcome::Resync { oldest_available, .. } => {
                        prop_assert!(cursor + 1 < oldest_available);
                    }
                }
                Ok(())
            })?;
        }
    }
}
