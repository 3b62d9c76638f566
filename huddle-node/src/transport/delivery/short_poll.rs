//! Short-poll delivery: answer at once and suggest when to come back
//!
//! The suggested interval drops to the minimum after activity and otherwise
//! grows by half each quiet poll, capped at the maximum. The previous
//! interval lives in the connection registration, so any node can answer
//! the next poll.

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use huddle_common::events::Topic;
use huddle_common::ids::ConnectionId;
use huddle_common::Result;

use super::{Cursor, Delivery, DeliveryHint, DeliveryOutcome, DeliveryRequest};
use crate::eventlog::{EventLog, ReadOutcome};
use crate::transport::state::ConnectionState;

pub struct ShortPollDelivery {
    events: Arc<EventLog>,
    topic: Topic,
    previous_interval: Option<Duration>,
    min_interval: Duration,
    max_interval: Duration,
}

impl ShortPollDelivery {
    pub fn new(
        events: Arc<EventLog>,
        topic: Topic,
        previous_interval: Option<Duration>,
        min_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            events,
            topic,
            previous_interval,
            min_interval,
            max_interval,
        }
    }
}

/// Interval to suggest after a poll
pub fn next_interval(
    previous: Option<Duration>,
    had_events: bool,
    min: Duration,
    max: Duration,
) -> Duration {
    if had_events {
        return min;
    }
    match previous {
        Some(prev) => prev.mul_f64(1.5).clamp(min, max),
        None => min,
    }
}

/// Entity tag of a log at a given head
///
/// Changes exactly when a new event is appended to the topic.
pub fn etag_for(topic: &Topic, head: u64) -> String {
    let digest = Sha256::digest(format!("{}#{}", topic, head).as_bytes());
    let hex = format!("{:x}", digest);
    format!("\"{}\"", &hex[..32])
}

#[async_trait]
impl Delivery for ShortPollDelivery {
    fn state(&self) -> ConnectionState {
        ConnectionState::ShortPolling
    }

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<DeliveryOutcome> {
        let limit = request.limit.max(1);
        let (cursor, read) = match request.cursor {
            Cursor::After(id) => (id, self.events.read_since(&self.topic, id, limit).await?),
            Cursor::Since(since) => (
                0,
                self.events.read_since_time(&self.topic, since, limit).await?,
            ),
        };

        match read {
            ReadOutcome::Resync {
                oldest_available,
                head,
            } => Ok(DeliveryOutcome::resync(
                ConnectionState::ShortPolling,
                cursor,
                oldest_available,
                head,
            )),
            ReadOutcome::Events {
                events,
                head,
                has_more,
            } => {
                let interval = next_interval(
                    self.previous_interval,
                    !events.is_empty(),
                    self.min_interval,
                    self.max_interval,
                );
                self.previous_interval = Some(interval);
                let mut outcome = DeliveryOutcome::batch(
                    ConnectionState::ShortPolling,
                    cursor,
                    events,
                    head,
                    has_more,
                );
                // A time cursor with nothing new leaves the client at the head
                if outcome.events.is_empty() && matches!(request.cursor, Cursor::Since(_)) {
                    outcome.cursor = head;
                }
                outcome.hint = DeliveryHint::PollAgain { interval };
                Ok(outcome)
            }
        }
    }
}

/// Per-connection request budget for short polling
pub struct PollRateLimiter {
    limiter: DefaultKeyedRateLimiter<ConnectionId>,
    clock: DefaultClock,
}

impl PollRateLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst)),
            clock: DefaultClock::default(),
        }
    }

    /// `Err(wait)` when the connection must back off
    pub fn check(&self, connection: &ConnectionId) -> std::result::Result<(), Duration> {
        self.limiter
            .check_key(connection)
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Drop state for connections that have been quiet long enough
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }

    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}
