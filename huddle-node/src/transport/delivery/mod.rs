//! Delivery modes
//!
//! Every mode answers the same question: given a cursor, which events go to
//! the client next, and what should the connection do afterwards. Call sites
//! hold a [`Transport`] and never branch on the mode themselves.

mod long_poll;
mod push;
mod short_poll;

pub use long_poll::LongPollDelivery;
pub use push::PushDelivery;
pub use short_poll::{etag_for, next_interval, PollRateLimiter, ShortPollDelivery};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use huddle_common::events::Event;
use huddle_common::{Error, Result};

use super::state::ConnectionState;

/// Where the client is in its log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Last event id the client has seen
    After(u64),
    /// Wall-clock position (short-poll only)
    Since(DateTime<Utc>),
}

impl Cursor {
    fn event_id(self) -> Result<u64> {
        match self {
            Cursor::After(id) => Ok(id),
            Cursor::Since(_) => Err(Error::InvalidInput(
                "timestamp cursors are only accepted by short polling".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub cursor: Cursor,
    pub limit: usize,
}

/// What the transport should tell the client besides the events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryHint {
    /// Events are ready (possibly none after a catch-up that found nothing)
    Events,
    /// Push: nothing arrived within the heartbeat interval
    Heartbeat,
    /// Long-poll: nothing arrived before the wait elapsed
    NoContent { retry_after: Duration },
    /// Short-poll: come back after `interval`
    PollAgain { interval: Duration },
    /// The cursor fell out of the retention window
    Resync { oldest_available: u64, head: u64 },
    /// The live feed ended
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub events: Vec<Event>,
    /// Cursor after the returned events
    pub cursor: u64,
    /// Last id assigned in the log, when known
    pub head: u64,
    pub has_more: bool,
    pub next_state: ConnectionState,
    pub hint: DeliveryHint,
}

impl DeliveryOutcome {
    fn resync(state: ConnectionState, cursor: u64, oldest_available: u64, head: u64) -> Self {
        Self {
            events: Vec::new(),
            cursor,
            head,
            has_more: false,
            next_state: state,
            hint: DeliveryHint::Resync {
                oldest_available,
                head,
            },
        }
    }

    fn batch(state: ConnectionState, cursor: u64, events: Vec<Event>, head: u64, has_more: bool) -> Self {
        let cursor = events.last().map_or(cursor, |e| e.id);
        Self {
            events,
            cursor,
            head,
            has_more,
            next_state: state,
            hint: DeliveryHint::Events,
        }
    }

    fn idle(state: ConnectionState, cursor: u64, hint: DeliveryHint) -> Self {
        Self {
            events: Vec::new(),
            cursor,
            head: cursor,
            has_more: false,
            next_state: state,
            hint,
        }
    }
}

/// Common contract of every delivery mode
#[async_trait]
pub trait Delivery: Send {
    /// Connection state this mode serves
    fn state(&self) -> ConnectionState;

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<DeliveryOutcome>;
}

/// The active mode of one connection
pub enum Transport {
    Push(PushDelivery),
    LongPoll(LongPollDelivery),
    ShortPoll(ShortPollDelivery),
}

impl Transport {
    fn as_delivery(&mut self) -> &mut dyn Delivery {
        match self {
            Transport::Push(d) => d,
            Transport::LongPoll(d) => d,
            Transport::ShortPoll(d) => d,
        }
    }
}

#[async_trait]
impl Delivery for Transport {
    fn state(&self) -> ConnectionState {
        match self {
            Transport::Push(d) => d.state(),
            Transport::LongPoll(d) => d.state(),
            Transport::ShortPoll(d) => d.state(),
        }
    }

    async fn deliver(&mut self, request: DeliveryRequest) -> Result<DeliveryOutcome> {
        self.as_delivery().deliver(request).await
    }
}
