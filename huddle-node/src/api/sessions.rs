//! Session endpoints
//!
//! Creation is the login hook called by the external auth layer, so it is
//! public; everything else acts on the caller's own session.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use huddle_common::ids::{TenantId, UserId};

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use crate::sessions::Session;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct PreferenceRequest {
    pub value: Value,
}

/// POST /sessions
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state
        .sessions
        .create(body.tenant_id, body.user_id, body.preferences)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions/current
pub async fn current_session(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Session>> {
    let session = state
        .sessions
        .get(&caller.session_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("session expired".into()))?;
    Ok(Json(session))
}

/// PUT /sessions/current/preferences/:key
pub async fn set_preference(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(key): Path<String>,
    Json(body): Json<PreferenceRequest>,
) -> ApiResult<Json<Session>> {
    let session = state
        .sessions
        .set_preference(&caller.session_id, &key, body.value)
        .await?;
    Ok(Json(session))
}

/// DELETE /sessions/:id (logout)
///
/// Only the caller's own session can be ended.
pub async fn delete_session(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if session_id != caller.session_id {
        return Err(ApiError::NotFound(format!("session {session_id}")));
    }
    state.sessions.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Public: session creation
pub fn login_routes() -> Router<AppState> {
    Router::new().route("/sessions", post(create_session))
}

/// Protected: the caller's own session
pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/current", get(current_session))
        .route("/sessions/current/preferences/:key", put(set_preference))
        .route("/sessions/:id", delete(delete_session))
}
