//! Long-poll delivery: hold the request until events exist or the wait ends

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use huddle_common::events::Topic;
use huddle_common::Result;

use super::{Delivery, DeliveryHint, DeliveryOutcome, DeliveryRequest};
use crate::eventlog::{EventLog, ReadOutcome, SubscriptionEvent};
use crate::transport::state::ConnectionState;

pub struct LongPollDelivery {
    events: Arc<EventLog>,
    topic: Topic,
    wait: Duration,
    retry_after: Duration,
}

impl LongPollDelivery {
    pub fn new(events: Arc<EventLog>, topic: Topic, wait: Duration, retry_after: Duration) -> Self {
        Self {
            events,
            topic,
            wait,
            retry_after,
        }
    }

    async fn read(&self, cursor: u64, limit: usize) -> Result<Option<DeliveryOutcome>> {
        match self.events.read_since(&self.topic, cursor, limit).await? {
            ReadOutcome::Resync {
                oldest_available,
                head,
            } => Ok(Some(DeliveryOutcome::resync(
                ConnectionState::LongPolling,
                cursor,
                oldest_available,
                head,
            ))),
            ReadOutcome::Events { events, .. } if events.is_empty() => Ok(None),
            ReadOutcome::Events {
                events,
                head,
                has_more,
            } => Ok(Some(DeliveryOutcome::batch(
                ConnectionState::LongPolling,
                cursor,
                events,
                head,
                has_more,
            ))),
        }
    }
}

#[async_trait]
impl Delivery for LongPollDelivery {
    fn state(&self) -> ConnectionState {
        ConnectionState::LongPolling
    }

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<DeliveryOutcome> {
        let cursor = request.cursor.event_id()?;
        let limit = request.limit.max(1);

        // Subscribe before reading so an append in between still wakes us
        let mut subscription = self.events.subscribe(&self.topic);
        if let Some(outcome) = self.read(cursor, limit).await? {
            return Ok(outcome);
        }

        let deadline = Instant::now() + self.wait;
        let idle = DeliveryOutcome::idle(
            ConnectionState::LongPolling,
            cursor,
            DeliveryHint::NoContent {
                retry_after: self.retry_after,
            },
        );
        loop {
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Err(_) | Ok(None) => return Ok(idle),
                Ok(Some(SubscriptionEvent::Event(event))) if event.id <= cursor => continue,
                Ok(Some(_)) => {
                    // The log is authoritative; the live event is only a wake-up
                    if let Some(outcome) = self.read(cursor, limit).await? {
                        return Ok(outcome);
                    }
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

    fn setup() -> (Arc<EventLog>, Topic) {
        let events = Arc::new(EventLog::new(
            Arc::new(MemoryStore::new()),
            &EventLogConfig::default(),
            "node-a",
        ));
        (events, Topic::new(TenantId::new("acme"), UserId::new("bob")))
    }

    fn request(cursor: u64) -> DeliveryRequest {
        DeliveryRequest {
            cursor: Cursor::After(cursor),
            limit: 50,
        }
    }

    #[tokio::test]
    async fn test_returns_immediately_when_events_exist() {
        let (events, topic) = setup();
        events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        let mut poll = LongPollDelivery::new(events, topic, Duration::from_secs(30), Duration::from_secs(5));

        let outcome = poll.deliver(request(0)).await.unwrap();
        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.cursor, 1);
        assert_eq!(outcome.hint, DeliveryHint::Events);
    }

    #[tokio::test]
    async fn test_wakes_on_publish() {
        let (events, topic) = setup();
        let mut poll = LongPollDelivery::new(
            events.clone(),
            topic.clone(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );

        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            events.publish(&topic, NewEvent::new("Ping", json!({}))).await.unwrap();
        });

        let outcome = poll.deliver(request(0)).await.unwrap();
        publisher.await.unwrap();
        assert_eq!(outcome.events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_wait_yields_no_content() {
        let (events, topic) = setup();
        let mut poll = LongPollDelivery::new(events, topic, Duration::from_secs(30), Duration::from_secs(5));

        let outcome = poll.deliver(request(0)).await.unwrap();
        assert!(outcome.events.is_empty());
        assert_eq!(
            outcome.hint,
            DeliveryHint::NoContent {
                retry_after: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_timestamp_cursor_rejected() {
        let (events, topic) = setup();
        let mut poll = LongPollDelivery::new(events, topic, Duration::from_secs(1), Duration::from_secs(5));
        let result = poll
            .deliver(DeliveryRequest {
                cursor: Cursor::Since(chrono::Utc::now()),
                limit: 10,
            })
            .await;
        assert!(matches!(result, Err(huddle_common::Error::InvalidInput(_))));
    }
}
