//! Push delivery: catch up from the log, then follow the live feed
//!
//! Each `deliver` call either hands back events or, after one heartbeat
//! interval of silence, a heartbeat hint. Live events at or below the cursor
//! were already sent; a jump in ids or a lagged feed means events were missed
//! and the log is re-read.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use huddle_common::events::Topic;
use huddle_common::Result;

use super::{Delivery, DeliveryHint, DeliveryOutcome, DeliveryRequest};
use crate::eventlog::{EventLog, ReadOutcome, Subscription, SubscriptionEvent};
use crate::transport::state::ConnectionState;

pub struct PushDelivery {
    events: Arc<EventLog>,
    subscription: Subscription,
    heartbeat: Duration,
    caught_up: bool,
}

impl PushDelivery {
    /// Subscribes immediately so nothing published after this call is missed
    pub fn new(events: Arc<EventLog>, topic: &Topic, heartbeat: Duration) -> Self {
        let subscription = events.subscribe(topic);
        Self {
            events,
            subscription,
            heartbeat,
            caught_up: false,
        }
    }

    /// Stop following the live feed; later calls report `Closed`
    pub fn cancel(&mut self) {
        self.subscription.cancel();
    }

    async fn catch_up(&mut self, cursor: u64, limit: usize) -> Result<DeliveryOutcome> {
        let topic = self.subscription.topic().clone();
        match self.events.read_since(&topic, cursor, limit).await? {
            ReadOutcome::Resync {
                oldest_available,
                head,
            } => {
                warn!(topic = %topic, cursor, oldest_available, "Push cursor evicted, resync required");
                Ok(DeliveryOutcome::resync(
                    ConnectionState::Closed,
                    cursor,
                    oldest_available,
                    head,
                ))
            }
            ReadOutcome::Events {
                events,
                head,
                has_more,
            } => {
                self.caught_up = !has_more;
                Ok(DeliveryOutcome::batch(
                    ConnectionState::Pushing,
                    cursor,
                    events,
                    head,
                    has_more,
                ))
            }
        }
    }
}

#[async_trait]
impl Delivery for PushDelivery {
    fn state(&self) -> ConnectionState {
        ConnectionState::Pushing
    }

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<DeliveryOutcome> {
        let cursor = request.cursor.event_id()?;
        let limit = request.limit.max(1);

        if !self.caught_up {
            let outcome = self.catch_up(cursor, limit).await?;
            if !outcome.events.is_empty() || outcome.next_state == ConnectionState::Closed {
                return Ok(outcome);
            }
        }

        let deadline = Instant::now() + self.heartbeat;
        loop {
            let next = match tokio::time::timeout_at(deadline, self.subscription.recv()).await {
                Err(_) => {
                    return Ok(DeliveryOutcome::idle(
                        ConnectionState::Pushing,
                        cursor,
                        DeliveryHint::Heartbeat,
                    ))
                }
                Ok(next) => next,
            };

            match next {
                None => {
                    return Ok(DeliveryOutcome::idle(
                        ConnectionState::Closed,
                        cursor,
                        DeliveryHint::Closed,
                    ))
                }
                Some(SubscriptionEvent::Lagged(skipped)) => {
                    warn!(skipped, "Push subscriber lagged, catching up from the log");
                    self.caught_up = false;
                    return self.catch_up(cursor, limit).await;
                }
                Some(SubscriptionEvent::Event(event)) if event.id <= cursor => {
                    debug!(event_id = event.id, cursor, "Skipping already delivered event");
                }
                Some(SubscriptionEvent::Event(event)) if event.id > cursor + 1 => {
                    debug!(event_id = event.id, cursor, "Gap in live feed, re-reading the log");
                    self.caught_up = false;
                    return self.catch_up(cursor, limit).await;
                }
                Some(SubscriptionEvent::Event(event)) => {
                    let head = event.id;
                    return Ok(DeliveryOutcome::batch(
                        ConnectionState::Pushing,
                        cursor,
                        vec![event],
                        head,
                        false,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::delivery::Cursor;
    use huddle_common::config::EventLogConfig;
    use huddle_common::events::NewEvent;
    use huddle_common::ids::{TenantId, UserId};
    use huddle_common::store::MemoryStore;
    use serde_json::json;

    fn setup(capacity: usize) -> (Arc<EventLog>, Topic) {
        let config = EventLogConfig {
            capacity,
            ..EventLogConfig::default()
        };
        let events = Arc::new(EventLog::new(Arc::new(MemoryStore::new()), &config, "node-a"));
        (events, Topic::new(TenantId::new("acme"), UserId::new("alice")))
    }

    fn after(cursor: u64) -> DeliveryRequest {
        DeliveryRequest {
            cursor: Cursor::After(cursor),
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_catch_up_then_live() {
        let (events, topic) = setup(100);
        for _ in 0..3 {
            events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        }
        let mut push = PushDelivery::new(events.clone(), &topic, Duration::from_secs(30));

        let first = push.deliver(after(1)).await.unwrap();
        assert_eq!(first.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(first.cursor, 3);

        events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        let live = push.deliver(after(first.cursor)).await.unwrap();
        assert_eq!(live.events.len(), 1);
        assert_eq!(live.cursor, 4);
    }

    #[tokio::test]
    async fn test_events_published_during_catch_up_are_not_duplicated() {
        let (events, topic) = setup(100);
        events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        let mut push = PushDelivery::new(events.clone(), &topic, Duration::from_secs(30));
        // Lands in both the log read and the live feed
        events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();

        let first = push.deliver(after(0)).await.unwrap();
        assert_eq!(first.cursor, 2);

        events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        let next = push.deliver(after(first.cursor)).await.unwrap();
        assert_eq!(next.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_yields_heartbeat() {
        let (events, topic) = setup(100);
        let mut push = PushDelivery::new(events, &topic, Duration::from_secs(30));
        let outcome = push.deliver(after(0)).await.unwrap();
        assert_eq!(outcome.hint, DeliveryHint::Heartbeat);
        assert_eq!(outcome.next_state, ConnectionState::Pushing);
    }

    #[tokio::test]
    async fn test_evicted_cursor_closes_with_resync() {
        let (events, topic) = setup(2);
        for _ in 0..5 {
            events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        }
        let mut push = PushDelivery::new(events, &topic, Duration::from_secs(30));
        let outcome = push.deliver(after(1)).await.unwrap();
        assert_eq!(outcome.next_state, ConnectionState::Closed);
        assert_eq!(
            outcome.hint,
            DeliveryHint::Resync {
                oldest_available: 4,
                head: 5
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_feed_reports_closed() {
        let (events, topic) = setup(10);
        let mut push = PushDelivery::new(events, &topic, Duration::from_secs(30));
        push.cancel();
        let outcome = push.deliver(after(0)).await.unwrap();
        assert_eq!(outcome.hint, DeliveryHint::Closed);
    }
}
