//! Conversation endpoints
//!
//! The caller acts as themselves: joining, leaving and posting always use the
//! session's user.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_common::events::ConversationStatus;
use huddle_common::ids::ProductId;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::parse_uuid;
use crate::conversations::{Conversation, PostedMessage};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationRequest {
    pub product_id: ProductId,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub until: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: ConversationStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextVersionResponse {
    pub context_version: u64,
}

/// POST /conversations
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<StartConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state
        .conversations
        .start(&caller.tenant_id, &body.product_id, &caller.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let id = parse_uuid(&id, "conversation")?;
    state
        .conversations
        .get(&caller.tenant_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("conversation {id}")))
}

/// POST /conversations/:id/join
pub async fn join(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let id = parse_uuid(&id, "conversation")?;
    let conversation = state
        .conversations
        .join(&caller.tenant_id, id, &caller.user_id)
        .await?;
    Ok(Json(conversation))
}

/// POST /conversations/:id/leave
pub async fn leave(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let id = parse_uuid(&id, "conversation")?;
    let conversation = state
        .conversations
        .leave(&caller.tenant_id, id, &caller.user_id)
        .await?;
    Ok(Json(conversation))
}

/// POST /conversations/:id/messages
pub async fn post_message(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> ApiResult<(StatusCode, Json<PostedMessage>)> {
    let id = parse_uuid(&id, "conversation")?;
    let posted = state
        .conversations
        .append_message(&caller.tenant_id, id, &caller.user_id, &body.body)
        .await?;
    Ok((StatusCode::CREATED, Json(posted)))
}

/// POST /conversations/:id/context-version
pub async fn bump_context_version(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContextVersionResponse>> {
    let id = parse_uuid(&id, "conversation")?;
    let context_version = state
        .conversations
        .bump_context_version(&caller.tenant_id, id)
        .await?;
    Ok(Json(ContextVersionResponse { context_version }))
}

/// POST /conversations/:id/extend
pub async fn extend(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<ExtendRequest>,
) -> ApiResult<Json<Conversation>> {
    let id = parse_uuid(&id, "conversation")?;
    let conversation = state
        .conversations
        .extend(&caller.tenant_id, id, body.until)
        .await?;
    Ok(Json(conversation))
}

/// POST /conversations/:id/status
pub async fn set_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> ApiResult<Json<Conversation>> {
    let id = parse_uuid(&id, "conversation")?;
    let conversation = state
        .conversations
        .set_status(&caller.tenant_id, id, body.status)
        .await?;
    Ok(Json(conversation))
}

pub fn conversation_routes() -> Router<AppState> {
    Router::new()
        .route("/conversations", post(start_conversation))
        .route("/conversations/:id", get(get_conversation))
        .route("/conversations/:id/join", post(join))
        .route("/conversations/:id/leave", post(leave))
        .route("/conversations/:id/messages", post(post_message))
        .route("/conversations/:id/context-version", post(bump_context_version))
        .route("/conversations/:id/extend", post(extend))
        .route("/conversations/:id/status", post(set_status))
}
