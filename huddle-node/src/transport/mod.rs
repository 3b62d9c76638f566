//! Transport Negotiator
//!
//! Decides per connection whether events are pushed, long-polled or
//! short-polled, and drains the user's log to the client in that mode.

pub mod delivery;
pub mod negotiator;
pub mod registry;
pub mod state;

pub use delivery::{
    etag_for, Cursor, Delivery, DeliveryHint, DeliveryOutcome, DeliveryRequest, LongPollDelivery,
    PollRateLimiter, PushDelivery, ShortPollDelivery, Transport,
};
pub use negotiator::{FallbackOutcome, Negotiator, PushAttachment};
pub use registry::{ConnectionKey, ConnectionRegistration, ConnectionRegistry};
pub use state::{Capabilities, ConnectionState};
