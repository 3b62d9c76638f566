//! Inconsistency workflow endpoints
//!
//! Detection lives outside huddle; reports arrive here and move through
//! review. `GET /inconsistencies/:id/blocking` is what the approval gate polls.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use huddle_common::events::InconsistencyStatus;
use huddle_common::ids::UserId;

use super::auth::Caller;
use super::error::{ApiError, ApiResult};
use super::parse_uuid;
use crate::inconsistency::{Inconsistency, NewInconsistency};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<InconsistencyStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AssignRequest {
    /// Defaults to the caller
    #[serde(default)]
    pub assignee: Option<UserId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub option_id: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
pub struct DismissRequest {
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingResponse {
    pub inconsistency_id: String,
    pub blocking: bool,
}

/// POST /inconsistencies
pub async fn open(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(report): Json<NewInconsistency>,
) -> ApiResult<(StatusCode, Json<Inconsistency>)> {
    let record = state.inconsistencies.open(&caller.tenant_id, report).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /inconsistencies?status=
pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Inconsistency>>> {
    Ok(Json(
        state
            .inconsistencies
            .list(&caller.tenant_id, query.status)
            .await?,
    ))
}

/// GET /inconsistencies/:id
pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Inconsistency>> {
    let id = parse_uuid(&id, "inconsistency")?;
    state
        .inconsistencies
        .get(&caller.tenant_id, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("inconsistency {id}")))
}

/// GET /inconsistencies/:id/blocking
pub async fn blocking(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<BlockingResponse>> {
    let uuid = parse_uuid(&id, "inconsistency")?;
    let blocking = state
        .inconsistencies
        .is_blocking(&caller.tenant_id, uuid)
        .await?;
    Ok(Json(BlockingResponse {
        inconsistency_id: uuid.to_string(),
        blocking,
    }))
}

/// POST /inconsistencies/:id/assign
pub async fn assign(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Option<Json<AssignRequest>>,
) -> ApiResult<Json<Inconsistency>> {
    let id = parse_uuid(&id, "inconsistency")?;
    let assignee = body
        .and_then(|Json(b)| b.assignee)
        .unwrap_or_else(|| caller.user_id.clone());
    let record = state
        .inconsistencies
        .assign(&caller.tenant_id, id, &assignee)
        .await?;
    Ok(Json(record))
}

/// POST /inconsistencies/:id/resolve
pub async fn resolve(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<ResolveRequest>,
) -> ApiResult<Json<Inconsistency>> {
    let id = parse_uuid(&id, "inconsistency")?;
    let record = state
        .inconsistencies
        .resolve(
            &caller.tenant_id,
            id,
            &caller.user_id,
            &body.option_id,
            &body.rationale,
        )
        .await?;
    Ok(Json(record))
}

/// POST /inconsistencies/:id/dismiss
pub async fn dismiss(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<DismissRequest>,
) -> ApiResult<Json<Inconsistency>> {
    let id = parse_uuid(&id, "inconsistency")?;
    let record = state
        .inconsistencies
        .dismiss(&caller.tenant_id, id, &caller.user_id, &body.rationale)
        .await?;
    Ok(Json(record))
}

pub fn inconsistency_routes() -> Router<AppState> {
    Router::new()
        .route("/inconsistencies", post(open).get(list))
        .route("/inconsistencies/:id", get(get_one))
        .route("/inconsistencies/:id/blocking", get(blocking))
        .route("/inconsistencies/:id/assign", post(assign))
        .route("/inconsistencies/:id/resolve", post(resolve))
        .route("/inconsistencies/:id/dismiss", post(dismiss))
}
