//! Push stream (Server-Sent Events)
//!
//! One cooperative loop per connection: wait for the next delivery (events or
//! a heartbeat), the connection's lifetime deadline, or cancellation by
//! close, fallback, re-attach or shutdown. When the client goes away the
//! stream is dropped, which unsubscribes at once and deletes the
//! registration in the background.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, Sse},
    routing::get,
    Extension, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

use huddle_common::sse;

use super::auth::Caller;
use super::connection_key;
use super::error::ApiResult;
use crate::transport::{
    ConnectionKey, Cursor, Delivery, DeliveryHint, DeliveryRequest, Negotiator, PushAttachment,
    PushDelivery,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamQuery {
    pub connection_id: String,
    #[serde(default)]
    pub last_event_id: Option<u64>,
}

/// Ends the registration when the stream goes away, unless a newer stream
/// or an explicit close/fallback took over
struct PushStreamGuard {
    negotiator: Arc<Negotiator>,
    key: ConnectionKey,
    attachment: PushAttachment,
}

impl Drop for PushStreamGuard {
    fn drop(&mut self) {
        if !self
            .negotiator
            .release_push(&self.key.connection_id, &self.attachment)
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.negotiator.registry().clone();
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(e) = registry.remove(&key).await {
                // The registration TTL cleans up instead
                warn!(connection = %key.connection_id, "Could not remove registration: {}", e);
            }
        });
    }
}

enum Step {
    Delivered(huddle_common::Result<crate::transport::DeliveryOutcome>),
    Cancelled,
    LifetimeReached,
}

fn header_cursor(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// GET /events?connectionId=&lastEventId=
pub async fn event_stream(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<EventStreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let key = connection_key(&caller, &query.connection_id)?;
    let attachment = state.negotiator.attach_push(&key).await?;

    let cursor = query
        .last_event_id
        .or_else(|| header_cursor(&headers))
        .unwrap_or(attachment.registration.cursor);
    let transport = &state.config.transport;
    let lifetime = transport.max_connection_lifetime();
    let batch = transport.catch_up_batch.max(1);
    let mut push = PushDelivery::new(state.events.clone(), &key.topic(), transport.heartbeat_interval());
    let registry = state.negotiator.registry().clone();
    let token = attachment.token.clone();

    info!(
        tenant = %caller.tenant_id,
        user = %caller.user_id,
        connection = %key.connection_id,
        cursor,
        "Push stream attached"
    );

    let guard = PushStreamGuard {
        negotiator: state.negotiator.clone(),
        key: key.clone(),
        attachment,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        let deadline = tokio::time::Instant::now() + lifetime;
        let mut cursor = cursor;
        yield Ok(sse::connected_frame(&key.connection_id.to_string(), cursor));

        loop {
            let request = DeliveryRequest {
                cursor: Cursor::After(cursor),
                limit: batch,
            };
            let step = tokio::select! {
                _ = token.cancelled() => Step::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Step::LifetimeReached,
                outcome = push.deliver(request) => Step::Delivered(outcome),
            };

            let outcome = match step {
                Step::Cancelled => {
                    debug!(connection = %key.connection_id, "Push stream cancelled");
                    yield Ok(sse::close_frame("cancelled"));
                    break;
                }
                Step::LifetimeReached => {
                    info!(connection = %key.connection_id, "Push stream reached max lifetime");
                    yield Ok(sse::close_frame("max lifetime reached; renegotiate"));
                    break;
                }
                Step::Delivered(Err(e)) => {
                    warn!(connection = %key.connection_id, "Push delivery failed: {}", e);
                    yield Ok(sse::close_frame("store unavailable; reconnect"));
                    break;
                }
                Step::Delivered(Ok(outcome)) => outcome,
            };

            match outcome.hint {
                DeliveryHint::Resync { oldest_available, head } => {
                    yield Ok(sse::resync_frame(oldest_available, head));
                    break;
                }
                DeliveryHint::Closed => {
                    yield Ok(sse::close_frame("feed closed"));
                    break;
                }
                DeliveryHint::Heartbeat => {
                    // Heartbeats keep the registration alive; a vanished one ends the stream
                    match registry.observe(&key, None).await {
                        Ok(_) => yield Ok(sse::heartbeat_frame(cursor)),
                        Err(huddle_common::Error::NotFound(_)) => {
                            yield Ok(sse::close_frame("connection closed"));
                            break;
                        }
                        Err(e) => {
                            warn!(connection = %key.connection_id, "Heartbeat refresh failed: {}", e);
                            yield Ok(sse::heartbeat_frame(cursor));
                        }
                    }
                }
                _ => {
                    for event in &outcome.events {
                        yield Ok(sse::event_frame(event));
                    }
                    if outcome.cursor > cursor {
                        cursor = outcome.cursor;
                        if let Err(e) = registry.observe(&key, Some(cursor)).await {
                            debug!(connection = %key.connection_id, "Cursor refresh failed: {}", e);
                        }
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream))
}

/// Build push stream routes
pub fn event_routes() -> Router<AppState> {
    Router::new().route("/events", get(event_stream))
}
