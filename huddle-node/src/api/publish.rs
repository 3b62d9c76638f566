//! Producer endpoint
//!
//! The chat handler and AI pipeline publish free-form events to users of
//! the caller's tenant.

use axum::{extract::State, http::StatusCode, routing::post, Extension, Json, Router};
use serde::Deserialize;
use serde_json::Value;

use huddle_common::events::{Event, NewEvent};
use huddle_common::ids::{is_valid_segment, UserId};

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub user_ids: Vec<UserId>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// POST /publish
///
/// Returns the stored events, one per recipient log.
pub async fn publish(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<PublishRequest>,
) -> ApiResult<(StatusCode, Json<Vec<Event>>)> {
    if body.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("event type must not be empty".into()));
    }
    if body.user_ids.is_empty() {
        return Err(ApiError::BadRequest("userIds must not be empty".into()));
    }
    if let Some(bad) = body.user_ids.iter().find(|u| !is_valid_segment(u.as_str())) {
        return Err(ApiError::BadRequest(format!("invalid user id: {bad}")));
    }

    let event = NewEvent::new(body.event_type, body.payload);
    let published = state
        .events
        .publish_many(&caller.tenant_id, body.user_ids.iter(), event)
        .await?;
    Ok((StatusCode::CREATED, Json(published)))
}

pub fn publish_routes() -> Router<AppState> {
    Router::new().route("/publish", post(publish))
}
