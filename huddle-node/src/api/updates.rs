//! Polling delivery (`GET /updates`)
//!
//! The connection's registered mode picks the behaviour:
//! - LongPolling: one request in flight per connection, held until events
//!   arrive or the wait ends (204 + `Retry-After`)
//! - ShortPolling: answers at once, rate-capped, with an adaptive
//!   `suggestedPollInterval` and `ETag`/`Last-Modified` validators
//!
//! A connection still negotiating is treated as having given up on push.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use huddle_common::events::{Event, Topic};
use huddle_common::store::{keys, StateStore};

use super::auth::Caller;
use super::connection_key;
use super::error::{ApiError, ApiResult};
use super::events::event_routes;
use crate::transport::{
    etag_for, ConnectionKey, ConnectionRegistration, ConnectionState, Cursor, Delivery,
    DeliveryHint, DeliveryOutcome, DeliveryRequest, LongPollDelivery, ShortPollDelivery,
    Transport,
};
use crate::AppState;

/// Slack on the lease TTL past the longest allowed wait
const LEASE_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesQuery {
    pub connection_id: String,
    #[serde(default)]
    pub last_event_id: Option<u64>,
    /// Long-poll wait in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Short-poll position: an event id or an RFC 3339 timestamp
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LongPollResponse {
    pub events: Vec<Event>,
    pub last_event_id: u64,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortPollResponse {
    pub updates: Vec<Event>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Seconds until the next poll
    pub suggested_poll_interval: f64,
    pub last_event_id: u64,
    pub has_more: bool,
}

/// Parse `since`: a plain number is an event id, anything else a timestamp
pub fn parse_since(raw: &str) -> ApiResult<Cursor> {
    let raw = raw.trim();
    if let Ok(id) = raw.parse::<u64>() {
        return Ok(Cursor::After(id));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Cursor::Since(t.with_timezone(&Utc)))
        .map_err(|_| ApiError::BadRequest(format!("since must be an event id or RFC 3339: {raw}")))
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// GET /updates
pub async fn poll_updates(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<UpdatesQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let key = connection_key(&caller, &query.connection_id)?;
    let registry = state.negotiator.registry();
    let registration = registry.require(&key).await?;

    match registration.state {
        ConnectionState::Negotiating => {
            let registration = registry
                .transition_from(
                    &key,
                    Some(ConnectionState::Negotiating),
                    ConnectionState::LongPolling,
                )
                .await?;
            debug!(connection = %key.connection_id, "Polled before push attached; long polling");
            long_poll(&state, &key, registration, &query).await
        }
        ConnectionState::LongPolling => long_poll(&state, &key, registration, &query).await,
        ConnectionState::ShortPolling => {
            short_poll(&state, &key, registration, &query, &headers).await
        }
        ConnectionState::Pushing => Err(ApiError::Conflict(
            "connection is pushing; report a fallback before polling".into(),
        )),
        ConnectionState::Closed => Err(ApiError::NotFound(format!(
            "connection {}",
            key.connection_id
        ))),
    }
}

/// Single-flight lease of one connection's long poll
///
/// Released explicitly once the poll is answered; a request dropped
/// mid-wait releases it in the background.
struct LongPollLease {
    store: Arc<dyn StateStore>,
    key: Option<String>,
}

impl LongPollLease {
    async fn acquire(state: &AppState, key: &ConnectionKey, wait: Duration) -> ApiResult<Self> {
        let lease_key = keys::long_poll_lease_key(&key.tenant_id, &key.connection_id);
        let holder = json!({ "node": state.node_id, "acquiredAt": Utc::now() });
        match state
            .stores
            .state
            .insert(&lease_key, holder, Some(wait + LEASE_SLACK))
            .await
        {
            Ok(_) => Ok(Self {
                store: state.stores.state.clone(),
                key: Some(lease_key),
            }),
            Err(huddle_common::Error::Conflict(_)) => {
                debug!(connection = %key.connection_id, "Concurrent long poll rejected");
                Err(ApiError::RateLimited {
                    retry_after: Duration::from_secs(1),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(mut self) {
        if let Some(key) = self.key.take() {
            if let Err(e) = self.store.delete(&key).await {
                warn!("Could not release long-poll lease {}: {}", key, e);
            }
        }
    }
}

impl Drop for LongPollLease {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        runtime.spawn(async move {
            // The TTL frees the lease otherwise
            if let Err(e) = store.delete(&key).await {
                warn!("Could not release long-poll lease {}: {}", key, e);
            }
        });
    }
}

async fn long_poll(
    state: &AppState,
    key: &ConnectionKey,
    registration: ConnectionRegistration,
    query: &UpdatesQuery,
) -> ApiResult<Response> {
    let transport = &state.config.transport;
    let max_wait = transport.long_poll_max_wait();
    let wait = query
        .timeout
        .map(Duration::from_secs)
        .map_or(max_wait, |t| t.min(max_wait));
    let cursor = query.last_event_id.unwrap_or(registration.cursor);

    let lease = LongPollLease::acquire(state, key, wait).await?;
    let mut delivery = Transport::LongPoll(LongPollDelivery::new(
        state.events.clone(),
        key.topic(),
        wait,
        Duration::from_secs(transport.long_poll_retry_after_secs),
    ));
    let delivered = delivery
        .deliver(DeliveryRequest {
            cursor: Cursor::After(cursor),
            limit: transport.catch_up_batch.max(1),
        })
        .await;
    lease.release().await;
    let outcome = delivered?;

    match outcome.hint {
        DeliveryHint::Resync {
            oldest_available,
            head,
        } => Err(ApiError::ResyncRequired {
            oldest_available,
            head,
        }),
        DeliveryHint::NoContent { retry_after } => {
            state.negotiator.registry().observe(key, None).await?;
            let mut response = StatusCode::NO_CONTENT.into_response();
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs().max(1)),
            );
            Ok(response)
        }
        _ => {
            state
                .negotiator
                .registry()
                .observe(key, Some(outcome.cursor))
                .await?;
            Ok(Json(LongPollResponse {
                last_event_id: outcome.cursor,
                has_more: outcome.has_more,
                events: outcome.events,
            })
            .into_response())
        }
    }
}

/// Timestamp of the newest event in the log, if it is still retained
async fn head_timestamp(state: &AppState, topic: &Topic, head: u64) -> ApiResult<Option<DateTime<Utc>>> {
    if head == 0 {
        return Ok(None);
    }
    let slice = state.events.store().read_since(topic, head - 1, 1).await?;
    Ok(slice.events.first().map(|e| e.timestamp))
}

/// `If-None-Match` / `If-Modified-Since` against the current head
fn not_modified(headers: &HeaderMap, etag: &str, last_modified: Option<DateTime<Utc>>) -> bool {
    if let Some(tags) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return tags.split(',').map(str::trim).any(|t| t == etag || t == "*");
    }
    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc));
    match (since, last_modified) {
        (Some(since), Some(modified)) => modified.timestamp() <= since.timestamp(),
        // Nothing was ever appended
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn validators(response: &mut Response, etag: &str, last_modified: Option<DateTime<Utc>>) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    if let Some(value) = last_modified.and_then(|t| HeaderValue::from_str(&http_date(t)).ok()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
}

async fn short_poll(
    state: &AppState,
    key: &ConnectionKey,
    registration: ConnectionRegistration,
    query: &UpdatesQuery,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    if let Err(wait) = state.poll_limiter.check(&key.connection_id) {
        debug!(connection = %key.connection_id, "Short poll rate limited");
        return Err(ApiError::RateLimited { retry_after: wait });
    }

    let transport = &state.config.transport;
    let topic = key.topic();
    let head = state.events.head(&topic).await?;
    let etag = etag_for(&topic, head);
    let head_modified = head_timestamp(state, &topic, head).await?;
    let registry = state.negotiator.registry();

    if not_modified(headers, &etag, head_modified) {
        registry.observe(key, None).await?;
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        validators(&mut response, &etag, head_modified);
        return Ok(response);
    }

    let cursor = match (&query.since, query.last_event_id) {
        (Some(since), _) => parse_since(since)?,
        (None, Some(id)) => Cursor::After(id),
        (None, None) => Cursor::After(registration.cursor),
    };
    let limit = query
        .limit
        .unwrap_or(transport.short_poll_max_limit)
        .clamp(1, transport.short_poll_max_limit.max(1));

    let mut delivery = Transport::ShortPoll(ShortPollDelivery::new(
        state.events.clone(),
        topic,
        registration.poll_interval_ms.map(Duration::from_millis),
        Duration::from_secs(transport.short_poll_min_interval_secs),
        Duration::from_secs(transport.short_poll_max_interval_secs),
    ));
    let outcome: DeliveryOutcome = delivery
        .deliver(DeliveryRequest { cursor, limit })
        .await?;

    let interval = match outcome.hint {
        DeliveryHint::Resync {
            oldest_available,
            head,
        } => {
            return Err(ApiError::ResyncRequired {
                oldest_available,
                head,
            })
        }
        DeliveryHint::PollAgain { interval } => interval,
        _ => Duration::from_secs(transport.short_poll_min_interval_secs),
    };

    registry.observe(key, Some(outcome.cursor)).await?;
    registry.set_poll_interval(key, interval).await?;

    let last_modified = outcome
        .events
        .last()
        .map(|e| e.timestamp)
        .or(head_modified);
    let mut response = Json(ShortPollResponse {
        last_modified,
        suggested_poll_interval: interval.as_secs_f64(),
        last_event_id: outcome.cursor,
        has_more: outcome.has_more,
        updates: outcome.events,
    })
    .into_response();
    validators(&mut response, &etag, head_modified);
    Ok(response)
}

/// Build delivery routes: the push stream and polling
pub fn delivery_routes() -> Router<AppState> {
    Router::new()
        .route("/updates", get(poll_updates))
        .merge(event_routes())
}
